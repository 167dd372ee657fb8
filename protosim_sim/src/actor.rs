//! Actors: roles that own accounts and choose protocol actions.
//!
//! A roster document names each role, how many instances to create, and the
//! actions it may perform with a selection probability:
//!
//! ```text
//! { "actors": [ { "name": "Borrower", "count": 3, "weight": 1.0,
//!                 "actions": [ { "name": "borrow", "probability": 0.5 } ] } ] }
//! ```

use crate::accounts::DeterministicAccountProvider;
use protosim_core::{ActionCatalogue, CoreError};
use protosim_env::AccountAddress;
use serde::Deserialize;
use tracing::debug;

const ROSTER: &str = "<actors>";

#[derive(Debug, Clone, Deserialize)]
struct RosterDocument {
    actors: Vec<RoleDocument>,
}

#[derive(Debug, Clone, Deserialize)]
struct RoleDocument {
    name: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default = "default_count")]
    count: usize,
    #[serde(default = "default_weight")]
    weight: f64,
    actions: Vec<ActionChoice>,
}

fn default_count() -> usize {
    1
}

fn default_weight() -> f64 {
    1.0
}

/// One action an actor may perform, with its relative selection weight.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionChoice {
    pub name: String,
    pub probability: f64,
}

/// A role as declared in the roster.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub summary: Option<String>,
    /// Number of independent actors created for this role
    pub count: usize,
    /// Relative weight when actors are chosen by weight
    pub weight: f64,
    pub actions: Vec<ActionChoice>,
}

/// The parsed actor roster.
#[derive(Debug, Clone, Default)]
pub struct ActorRoster {
    pub roles: Vec<Role>,
}

impl ActorRoster {
    /// Parses a roster and checks it against the action catalogue.
    ///
    /// Unknown action names and negative or non-finite weights are
    /// authoring errors.
    pub fn from_json(json: &str, catalogue: &ActionCatalogue) -> Result<Self, CoreError> {
        let doc: RosterDocument =
            serde_json::from_str(json).map_err(|e| CoreError::malformed(ROSTER, e.to_string()))?;

        let mut roles: Vec<Role> = Vec::with_capacity(doc.actors.len());
        for role in doc.actors {
            if roles.iter().any(|r| r.name == role.name) {
                return Err(CoreError::malformed(ROSTER, format!("duplicate role '{}'", role.name)));
            }
            if !role.weight.is_finite() || role.weight < 0.0 {
                return Err(CoreError::malformed(
                    ROSTER,
                    format!("role '{}' has invalid weight {}", role.name, role.weight),
                ));
            }
            for choice in &role.actions {
                if !catalogue.contains(&choice.name) {
                    return Err(CoreError::malformed(
                        ROSTER,
                        format!("role '{}' references unknown action '{}'", role.name, choice.name),
                    ));
                }
                if !choice.probability.is_finite() || choice.probability < 0.0 {
                    return Err(CoreError::malformed(
                        ROSTER,
                        format!(
                            "role '{}' gives action '{}' invalid probability {}",
                            role.name, choice.name, choice.probability
                        ),
                    ));
                }
            }
            roles.push(Role {
                name: role.name,
                summary: role.summary,
                count: role.count,
                weight: role.weight,
                actions: role.actions,
            });
        }

        Ok(Self { roles })
    }
}

/// A concrete actor instance with its accounts.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Unique id: the role name, suffixed `#i` when the role has several
    pub id: String,

    /// Role this actor was created from
    pub role: String,

    /// Accounts controlled by this actor; the first one sends calls
    pub accounts: Vec<AccountAddress>,

    /// Selection weight
    pub weight: f64,

    /// Permitted actions
    pub actions: Vec<ActionChoice>,
}

impl Actor {
    /// The sending account for this actor's calls.
    pub fn primary_account(&self) -> &AccountAddress {
        &self.accounts[0]
    }

    /// Whether any permitted action can ever be picked.
    pub fn has_selectable_actions(&self) -> bool {
        self.actions.iter().any(|a| a.probability > 0.0)
    }
}

/// Every actor of a run, in roster order.
#[derive(Debug, Clone, Default)]
pub struct ActorRegistry {
    actors: Vec<Actor>,
}

impl ActorRegistry {
    /// Instantiates the roster, assigning one deterministic account per actor.
    pub fn from_roster(roster: &ActorRoster, accounts: &mut DeterministicAccountProvider) -> Self {
        let mut actors = Vec::new();
        let mut next_account = 0u64;

        for role in &roster.roles {
            for i in 0..role.count {
                let id = if role.count > 1 {
                    format!("{}#{}", role.name, i)
                } else {
                    role.name.clone()
                };
                let account = accounts.account(next_account);
                next_account += 1;
                debug!("Actor {} -> {}", id, account);
                actors.push(Actor {
                    id,
                    role: role.name.clone(),
                    accounts: vec![account],
                    weight: role.weight,
                    actions: role.actions.clone(),
                });
            }
        }

        Self { actors }
    }

    pub fn get(&self, index: usize) -> Option<&Actor> {
        self.actors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actor> {
        self.actors.iter()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// All accounts of all actors, for balance snapshots.
    pub fn all_accounts(&self) -> Vec<AccountAddress> {
        self.actors.iter().flat_map(|a| a.accounts.iter().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTION: &str = r#"{"name": "ping", "contract": "C"}"#;

    fn catalogue() -> ActionCatalogue {
        ActionCatalogue::from_json(ACTION).unwrap()
    }

    #[test]
    fn test_roster_expands_counts() {
        let roster = ActorRoster::from_json(
            r#"{"actors": [
                {"name": "Borrower", "count": 2, "actions": [{"name": "ping", "probability": 1.0}]},
                {"name": "Keeper", "weight": 0.5, "actions": [{"name": "ping", "probability": 0.0}]}
            ]}"#,
            &catalogue(),
        )
        .unwrap();
        let registry = ActorRegistry::from_roster(&roster, &mut DeterministicAccountProvider::new(7));

        let ids: Vec<&str> = registry.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["Borrower#0", "Borrower#1", "Keeper"]);
        assert_eq!(registry.all_accounts().len(), 3);
        assert_ne!(registry.get(0).unwrap().primary_account(), registry.get(1).unwrap().primary_account());
        assert!(!registry.get(2).unwrap().has_selectable_actions());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = ActorRoster::from_json(
            r#"{"actors": [{"name": "A", "actions": [{"name": "pong", "probability": 1.0}]}]}"#,
            &catalogue(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("pong"));
    }

    #[test]
    fn test_negative_probability_rejected() {
        let err = ActorRoster::from_json(
            r#"{"actors": [{"name": "A", "actions": [{"name": "ping", "probability": -0.1}]}]}"#,
            &catalogue(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedActionModel { .. }));
    }

    #[test]
    fn test_same_seed_same_accounts() {
        let roster = ActorRoster::from_json(
            r#"{"actors": [{"name": "A", "count": 3, "actions": []}]}"#,
            &catalogue(),
        )
        .unwrap();
        let a = ActorRegistry::from_roster(&roster, &mut DeterministicAccountProvider::new(1));
        let b = ActorRegistry::from_roster(&roster, &mut DeterministicAccountProvider::new(1));
        assert_eq!(a.all_accounts(), b.all_accounts());
    }
}
