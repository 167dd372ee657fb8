//! Validator - Pre/Post State Comparison for Executed Actions
//! ===========================================================
//!
//! Checks one executed step against its action model:
//!
//! - declared state updates: expected post-value vs observed post-value
//! - mutual exclusivity of conditional updates on the same resolved target
//! - explicit post-execution validation rules
//! - closed world: nothing changes unless an applied update declares it
//! - protocol-wide invariants, when configured
//!
//! Usage:
//! ```ignore
//! use protosim_core::validation::Validator;
//!
//! let validator = Validator::new().with_ignored(["StableBaseCDP.lastUpdated"]);
//! let results = validator.evaluate(&model, &pre, &post, &params, &outcome, &actor);
//! let violations = results.iter().filter(|r| r.is_violation()).count();
//! ```

use crate::action_model::{ActionModel, Effect, StateUpdate};
use crate::error::CoreError;
use crate::eval::{eval, eval_bool, eval_int, resolve_keys, Bindings};
use crate::invariants::ProtocolInvariants;
use crate::outcome::ExecutionOutcome;
use crate::params::Parameters;
use crate::path::FieldPath;
use crate::snapshot::WorldState;
use num_bigint::BigInt;
use protosim_env::{AccountAddress, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// =============================================================================
// RULE RESULTS
// =============================================================================

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Satisfied,
    Violated,
    /// The rule does not apply to this step (condition false, call reverted)
    Inapplicable,
    /// The rule itself is defective (unresolved reference, type error)
    AuthoringError,
}

/// Which check produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    StateUpdate,
    ValidationRule,
    ClosedWorld,
    Exclusivity,
    Invariant,
    Transition,
    Queue,
}

/// Result of one rule for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub label: String,
    pub kind: RuleKind,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RuleResult {
    pub fn satisfied(label: &str, kind: RuleKind) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: RuleStatus::Satisfied,
            detail: None,
        }
    }

    pub fn violated(label: &str, kind: RuleKind, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: RuleStatus::Violated,
            detail: Some(detail.into()),
        }
    }

    pub fn inapplicable(label: &str, kind: RuleKind, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: RuleStatus::Inapplicable,
            detail: Some(detail.into()),
        }
    }

    pub fn authoring(label: &str, kind: RuleKind, error: impl std::fmt::Display) -> Self {
        Self {
            label: label.to_string(),
            kind,
            status: RuleStatus::AuthoringError,
            detail: Some(error.to_string()),
        }
    }

    pub fn is_violation(&self) -> bool {
        self.status == RuleStatus::Violated
    }

    pub fn is_authoring_error(&self) -> bool {
        self.status == RuleStatus::AuthoringError
    }
}

/// Per-status tallies over a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTally {
    pub satisfied: usize,
    pub violated: usize,
    pub inapplicable: usize,
    pub authoring_errors: usize,
}

impl RuleTally {
    /// Counts results by status.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a RuleResult>) -> Self {
        let mut tally = Self::default();
        for r in results {
            tally.add(r.status);
        }
        tally
    }

    pub fn add(&mut self, status: RuleStatus) {
        match status {
            RuleStatus::Satisfied => self.satisfied += 1,
            RuleStatus::Violated => self.violated += 1,
            RuleStatus::Inapplicable => self.inapplicable += 1,
            RuleStatus::AuthoringError => self.authoring_errors += 1,
        }
    }

    pub fn merge(&mut self, other: &RuleTally) {
        self.satisfied += other.satisfied;
        self.violated += other.violated;
        self.inapplicable += other.inapplicable;
        self.authoring_errors += other.authoring_errors;
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// A declared update whose condition held, with its target resolved.
struct Applied<'m> {
    update: &'m StateUpdate,
    path: FieldPath,
}

/// Evaluates executed steps against their action models.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    /// Field prefixes exempt from the closed-world check
    ignored: Vec<FieldPath>,
    invariants: ProtocolInvariants,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exempts field prefixes (e.g. `accounts`, `StableBaseCDP.lastUpdated`)
    /// from the closed-world check.
    pub fn with_ignored<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignored
            .extend(prefixes.into_iter().map(|p| FieldPath::parse_prefix(p.as_ref())));
        self
    }

    pub fn with_invariants(mut self, invariants: ProtocolInvariants) -> Self {
        self.invariants = invariants;
        self
    }

    fn is_ignored(&self, path: &FieldPath) -> bool {
        self.ignored.iter().any(|prefix| prefix.covers(path))
    }

    /// Runs every applicable rule for one executed step.
    pub fn evaluate(
        &self,
        model: &ActionModel,
        pre: &WorldState,
        post: &WorldState,
        params: &Parameters,
        outcome: &ExecutionOutcome,
        actor: &AccountAddress,
    ) -> Vec<RuleResult> {
        let bindings = Bindings::new(pre, params)
            .with_post(post)
            .with_outcome(outcome)
            .with_actor(actor);

        let mut results = match outcome {
            ExecutionOutcome::Success { .. } => self.evaluate_success(model, pre, post, &bindings),
            ExecutionOutcome::Reverted { reason } => self.evaluate_reverted(model, pre, post, reason),
            ExecutionOutcome::InfrastructureError { .. } => return Vec::new(),
        };

        if !self.invariants.is_empty() {
            results.extend(self.invariants.check(&bindings));
        }

        for r in results.iter().filter(|r| r.is_violation()) {
            warn!(
                "Violation in '{}' [{:?}] {}: {}",
                model.name,
                r.kind,
                r.label,
                r.detail.as_deref().unwrap_or("")
            );
        }
        results
    }

    fn evaluate_success(
        &self,
        model: &ActionModel,
        pre: &WorldState,
        post: &WorldState,
        bindings: &Bindings<'_>,
    ) -> Vec<RuleResult> {
        let mut results = Vec::new();
        let mut applied: Vec<Applied<'_>> = Vec::new();
        // Targets of updates that could not be checked; their changes are
        // neither confirmed nor flagged.
        let mut exempt: Vec<FieldPath> = Vec::new();
        let target_root = |update: &StateUpdate| {
            FieldPath::new(vec![update.target.head_field().unwrap_or(model.contract.as_str()).to_string()])
        };

        for update in &model.updates {
            let label = update.label();
            if let Some(condition) = &update.condition {
                match eval_bool(condition, bindings) {
                    Ok(true) => {}
                    Ok(false) => {
                        results.push(RuleResult::inapplicable(&label, RuleKind::StateUpdate, "condition false"));
                        continue;
                    }
                    Err(e) => {
                        results.push(RuleResult::authoring(&label, RuleKind::StateUpdate, e));
                        exempt.push(resolve_keys(&update.target, bindings).unwrap_or_else(|_| target_root(update)));
                        continue;
                    }
                }
            }
            match resolve_keys(&update.target, bindings) {
                Ok(path) => applied.push(Applied { update, path }),
                Err(e) => {
                    results.push(RuleResult::authoring(&label, RuleKind::StateUpdate, e));
                    exempt.push(target_root(update));
                }
            }
        }

        // one result per resolved target, in first-applied order
        let mut targets: Vec<&FieldPath> = Vec::new();
        for a in &applied {
            if !targets.contains(&&a.path) {
                targets.push(&a.path);
            }
        }

        for path in targets {
            let group: Vec<&Applied<'_>> = applied.iter().filter(|a| &a.path == path).collect();
            let label = format!("{}: {}", group[0].update.category, path);

            let conditional = group.iter().filter(|a| a.update.is_conditional()).count();
            if conditional > 1 {
                results.push(RuleResult::authoring(
                    &label,
                    RuleKind::Exclusivity,
                    format!("{} conditional updates applied to {}", conditional, path),
                ));
                continue;
            }

            results.push(match expected_value(&group, pre, bindings) {
                Ok(expected) => match post.lookup(path.keys()) {
                    Some(actual) if actual == &expected => RuleResult::satisfied(&label, RuleKind::StateUpdate),
                    Some(actual) => RuleResult::violated(
                        &label,
                        RuleKind::StateUpdate,
                        format!(
                            "expected {}, found {} (pre {})",
                            expected,
                            actual,
                            describe(pre.lookup(path.keys()))
                        ),
                    ),
                    None => RuleResult::violated(
                        &label,
                        RuleKind::StateUpdate,
                        format!("expected {}, field missing after execution", expected),
                    ),
                },
                Err(e) => RuleResult::authoring(&label, RuleKind::StateUpdate, e),
            });
        }

        for rule in &model.rules {
            results.push(match eval_bool(&rule.expr, bindings) {
                Ok(true) => RuleResult::satisfied(&rule.label, RuleKind::ValidationRule),
                Ok(false) => RuleResult::violated(&rule.label, RuleKind::ValidationRule, rule.expr.to_string()),
                Err(e) => RuleResult::authoring(&rule.label, RuleKind::ValidationRule, e),
            });
        }

        exempt.sort();
        exempt.dedup();
        for path in &exempt {
            results.push(RuleResult::inapplicable(
                &format!("closed-world: {}", path),
                RuleKind::ClosedWorld,
                "not checked: update target has an authoring error",
            ));
        }

        let declared: Vec<&FieldPath> = applied.iter().map(|a| &a.path).chain(exempt.iter()).collect();
        results.extend(self.closed_world(pre, post, |path| {
            declared.iter().any(|d| d.covers(path))
        }));

        debug!("Validated '{}': {} results", model.name, results.len());
        results
    }

    fn evaluate_reverted(
        &self,
        model: &ActionModel,
        pre: &WorldState,
        post: &WorldState,
        reason: &str,
    ) -> Vec<RuleResult> {
        let detail = format!("call reverted: {}", reason);
        let mut results: Vec<RuleResult> = model
            .updates
            .iter()
            .map(|u| RuleResult::inapplicable(&u.label(), RuleKind::StateUpdate, detail.clone()))
            .collect();
        results.extend(
            model
                .rules
                .iter()
                .map(|r| RuleResult::inapplicable(&r.label, RuleKind::ValidationRule, detail.clone())),
        );
        results.extend(self.closed_world(pre, post, |_| false));
        results
    }

    /// Flags every changed field not covered by `declared` or an ignored
    /// prefix. Emits a single satisfied result when nothing is flagged.
    fn closed_world(
        &self,
        pre: &WorldState,
        post: &WorldState,
        declared: impl Fn(&FieldPath) -> bool,
    ) -> Vec<RuleResult> {
        let violations: Vec<RuleResult> = pre
            .diff(post)
            .into_iter()
            .filter(|change| !declared(&change.path) && !self.is_ignored(&change.path))
            .map(|change| {
                RuleResult::violated(
                    &format!("closed-world: {}", change.path),
                    RuleKind::ClosedWorld,
                    format!(
                        "undeclared change {} -> {}",
                        describe(change.before.as_ref()),
                        describe(change.after.as_ref())
                    ),
                )
            })
            .collect();

        if violations.is_empty() {
            vec![RuleResult::satisfied("closed-world", RuleKind::ClosedWorld)]
        } else {
            violations
        }
    }
}

fn describe(value: Option<&Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "<absent>".to_string())
}

/// Folds the applied updates for one target in declaration order: deltas
/// add to the running value (the pre-value, or zero when absent), sets
/// replace it.
fn expected_value(
    group: &[&Applied<'_>],
    pre: &WorldState,
    bindings: &Bindings<'_>,
) -> Result<Value, CoreError> {
    let mut running: Option<Value> = pre.lookup(group[0].path.keys()).cloned();
    for applied in group {
        running = Some(match &applied.update.effect {
            Effect::Set(expr) => eval(expr, bindings)?,
            Effect::Delta(expr) => {
                let base = match &running {
                    None => BigInt::from(0),
                    Some(Value::Int(i)) => i.clone(),
                    Some(other) => return Err(CoreError::type_mismatch("int", other.type_name())),
                };
                Value::Int(base + eval_int(expr, bindings)?)
            }
        });
    }
    running.ok_or_else(|| CoreError::unresolved(&group[0].path))
}
