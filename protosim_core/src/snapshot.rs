//! Snapshot Store: immutable, step-addressed captures of world state.

use crate::path::FieldPath;
use protosim_env::{AccountAddress, EnvError, ExecutionEnvironment, SnapshotProvider, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Top-level key under which account data appears in state paths.
pub const ACCOUNTS_KEY: &str = "accounts";

/// Captured contract and account state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    /// Contract reference name -> captured field values
    pub contracts: BTreeMap<String, Value>,

    /// Account address -> balance and metadata
    pub accounts: BTreeMap<String, Value>,
}

/// One changed leaf between two world states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: FieldPath,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl WorldState {
    /// Looks up a resolved path. `accounts.<address>...` addresses account
    /// data; every other path starts with a contract name.
    pub fn lookup(&self, keys: &[String]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        let (mut value, rest) = if first == ACCOUNTS_KEY {
            let (address, rest) = rest.split_first()?;
            (self.accounts.get(&address.to_lowercase())?, rest)
        } else {
            (self.contracts.get(first)?, rest)
        };
        for key in rest {
            value = value.child(key)?;
        }
        Some(value)
    }

    /// Flattens the state into its scalar leaves.
    pub fn leaves(&self) -> BTreeMap<FieldPath, Value> {
        let mut out = BTreeMap::new();
        for (name, value) in &self.contracts {
            flatten(FieldPath::new(vec![name.clone()]), value, &mut out);
        }
        for (address, value) in &self.accounts {
            flatten(
                FieldPath::new(vec![ACCOUNTS_KEY.to_string(), address.clone()]),
                value,
                &mut out,
            );
        }
        out
    }

    /// Every leaf that differs between `self` (before) and `after`.
    pub fn diff(&self, after: &WorldState) -> Vec<FieldChange> {
        let before = self.leaves();
        let after = after.leaves();
        let mut changes = Vec::new();
        for (path, old) in &before {
            match after.get(path) {
                Some(new) if new == old => {}
                new => changes.push(FieldChange {
                    path: path.clone(),
                    before: Some(old.clone()),
                    after: new.cloned(),
                }),
            }
        }
        for (path, new) in &after {
            if !before.contains_key(path) {
                changes.push(FieldChange {
                    path: path.clone(),
                    before: None,
                    after: Some(new.clone()),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }
}

/// Empty mappings and lists contribute no leaves, so a mapping gaining its
/// first entry reports only the entry's fields as changed.
fn flatten(prefix: FieldPath, value: &Value, out: &mut BTreeMap<FieldPath, Value>) {
    match value {
        Value::Map(m) => {
            for (k, v) in m {
                flatten(prefix.child(k), v, out);
            }
        }
        Value::List(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(prefix.child(&i.to_string()), v, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

/// When in a step a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Initial,
    Pre,
    Post,
    /// Extra capture used for serialization checks
    Diagnostic,
}

/// Snapshot identity: run step index plus phase, never a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub step: u64,
    pub phase: SnapshotPhase,
}

impl SnapshotId {
    pub fn initial() -> Self {
        Self {
            step: 0,
            phase: SnapshotPhase::Initial,
        }
    }

    pub fn pre(step: u64) -> Self {
        Self {
            step,
            phase: SnapshotPhase::Pre,
        }
    }

    pub fn post(step: u64) -> Self {
        Self {
            step,
            phase: SnapshotPhase::Post,
        }
    }

    pub fn diagnostic(step: u64) -> Self {
        Self {
            step,
            phase: SnapshotPhase::Diagnostic,
        }
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            SnapshotPhase::Initial => "initial",
            SnapshotPhase::Pre => "pre",
            SnapshotPhase::Post => "post",
            SnapshotPhase::Diagnostic => "diagnostic",
        };
        write!(f, "{}:{}", self.step, phase)
    }
}

/// An immutable captured state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub state: WorldState,
}

/// Snapshot providers keyed by contract kind.
pub type ProviderSet = BTreeMap<String, Arc<dyn SnapshotProvider>>;

/// Reads the full world state from the environment.
///
/// Calls the matching provider for every deployed contract and looks up the
/// balance of every actor account. Read-only: capturing twice with no
/// intervening execution yields equal states.
pub async fn capture_state(
    env: &dyn ExecutionEnvironment,
    providers: &ProviderSet,
    accounts: &[AccountAddress],
) -> Result<WorldState, EnvError> {
    let mut state = WorldState::default();

    for contract in env.contracts() {
        let provider = providers.get(&contract.kind).ok_or_else(|| {
            EnvError::snapshot(format!(
                "no snapshot provider for kind '{}' ({})",
                contract.kind, contract.name
            ))
        })?;
        let fields = provider.snapshot(&contract, accounts).await?;
        state.contracts.insert(contract.name.clone(), Value::Map(fields));
    }

    for account in accounts {
        let balance = env.balance(account).await?;
        let mut entry = BTreeMap::new();
        entry.insert("balance".to_string(), Value::Int(balance));
        state
            .accounts
            .insert(account.as_str().to_string(), Value::Map(entry));
    }

    Ok(state)
}

/// Append-only sequence of snapshots for one run.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: Vec<Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current state and appends it under `id`.
    pub async fn capture(
        &mut self,
        env: &dyn ExecutionEnvironment,
        providers: &ProviderSet,
        accounts: &[AccountAddress],
        id: SnapshotId,
    ) -> Result<&Snapshot, EnvError> {
        let state = capture_state(env, providers, accounts).await?;
        debug!("Captured snapshot {} ({} contracts)", id, state.contracts.len());
        Ok(self.record(id, state))
    }

    /// Appends an already captured state.
    pub fn record(&mut self, id: SnapshotId, state: WorldState) -> &Snapshot {
        self.snapshots.push(Snapshot { id, state });
        &self.snapshots[self.snapshots.len() - 1]
    }

    /// Finds a snapshot by id.
    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.id == id)
    }

    /// The most recently appended snapshot.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn all(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Consumes the store, returning the snapshots in capture order.
    pub fn into_snapshots(self) -> Vec<Snapshot> {
        self.snapshots
    }
}
