//! Action Model: the static description of one protocol action.
//!
//! Loaded once from the analysis document, checked with
//! [`ActionModel::validate_self`], and never mutated during a run.
//!
//! # Document shape
//!
//! ```text
//! { "name", "contract", "function"?, "summary"?,
//!   "pre_execution_parameter_generation_rules": [{ "name", "rule" }],
//!   "pre_execution_conditions": [expr]?,
//!   "on_execution_state_updates_made": [{ "category", "state_updates": [
//!       { "target", "has_conditional_updates"?, "condition"?,
//!         "effect": { "delta": expr } | { "set": expr } } ] }],
//!   "post_execution_contract_state_validation_rules": [{ "category", "rules": [expr] }] }
//! ```

use crate::error::CoreError;
use crate::expr::Expr;
use crate::params::{self, ParameterConstraint, ParameterDraw, ParameterRule, RuleDocument};
use crate::parser::{parse_expr, parse_target};
use crate::path::{Root, Segment, StatePath};
use crate::snapshot::WorldState;
use protosim_env::{AccountAddress, Value};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ActionDocument {
    name: String,
    contract: String,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    pre_execution_parameter_generation_rules: Vec<ParameterDocument>,
    #[serde(default)]
    pre_execution_conditions: Vec<String>,
    #[serde(default)]
    on_execution_state_updates_made: Vec<UpdateGroupDocument>,
    #[serde(default)]
    post_execution_contract_state_validation_rules: Vec<RuleGroupDocument>,
}

#[derive(Debug, Deserialize)]
struct ParameterDocument {
    name: String,
    rule: RuleDocument,
}

#[derive(Debug, Deserialize)]
struct UpdateGroupDocument {
    category: String,
    state_updates: Vec<UpdateDocument>,
}

#[derive(Debug, Deserialize)]
struct UpdateDocument {
    target: String,
    #[serde(default)]
    has_conditional_updates: Option<bool>,
    #[serde(default)]
    condition: Option<String>,
    effect: EffectDocument,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EffectDocument {
    Delta(Value),
    Set(Value),
}

#[derive(Debug, Deserialize)]
struct RuleGroupDocument {
    category: String,
    rules: Vec<String>,
}

/// How a state update changes its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Adds to the pre-state value (missing counts as zero)
    Delta(Expr),
    /// Replaces the value
    Set(Expr),
}

impl Effect {
    pub fn expr(&self) -> &Expr {
        match self {
            Effect::Delta(e) | Effect::Set(e) => e,
        }
    }
}

/// One declared state update.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub category: String,
    pub target: StatePath,
    /// Evaluated against the pre-state and parameters; `None` always applies
    pub condition: Option<Expr>,
    pub effect: Effect,
}

impl StateUpdate {
    /// Label used in rule results.
    pub fn label(&self) -> String {
        format!("{}: {}", self.category, self.target)
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    fn expressions(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = index_exprs(&self.target);
        out.extend(self.condition.iter());
        out.push(self.effect.expr());
        out
    }
}

fn index_exprs(path: &StatePath) -> Vec<&Expr> {
    path.segments
        .iter()
        .filter_map(|s| match s {
            Segment::Index(e) => Some(e),
            Segment::Field(_) => None,
        })
        .collect()
}

/// One post-execution validation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRule {
    pub category: String,
    pub label: String,
    pub expr: Expr,
}

/// Typed representation of one protocol action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionModel {
    pub name: String,
    /// Owning contract reference name
    pub contract: String,
    /// Method invoked on the contract; defaults to `name`
    pub function: String,
    pub summary: Option<String>,
    pub parameters: Vec<ParameterConstraint>,
    pub preconditions: Vec<Expr>,
    pub updates: Vec<StateUpdate>,
    pub rules: Vec<ValidationRule>,
}

fn effect_expr(action: &str, value: &Value) -> Result<Expr, CoreError> {
    match value {
        Value::Int(_) | Value::Bool(_) => Ok(Expr::Literal(value.clone())),
        Value::Text(src) => parse_expr(src).map_err(|e| CoreError::malformed(action, e.to_string())),
        other => Err(CoreError::malformed(
            action,
            format!("effect must be an expression, got {}", other.type_name()),
        )),
    }
}

impl ActionModel {
    /// Parses and validates an action model document.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| CoreError::malformed("<unnamed>", e.to_string()))?;
        Self::from_value(value)
    }

    /// Builds a model from an already parsed JSON document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("<unnamed>")
            .to_string();
        let doc: ActionDocument =
            serde_json::from_value(value).map_err(|e| CoreError::malformed(&name, e.to_string()))?;
        let model = Self::compile(doc)?;
        model.validate_self()?;
        debug!(
            "Loaded action '{}' ({} params, {} updates, {} rules)",
            model.name,
            model.parameters.len(),
            model.updates.len(),
            model.rules.len()
        );
        Ok(model)
    }

    fn compile(doc: ActionDocument) -> Result<Self, CoreError> {
        let action = doc.name.as_str();
        let malformed = |e: CoreError| CoreError::malformed(action, e.to_string());

        let parameters = doc
            .pre_execution_parameter_generation_rules
            .iter()
            .map(|p| {
                Ok(ParameterConstraint {
                    name: p.name.clone(),
                    rule: ParameterRule::compile(action, &p.rule)?,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let preconditions = doc
            .pre_execution_conditions
            .iter()
            .map(|c| parse_expr(c).map_err(malformed))
            .collect::<Result<Vec<_>, CoreError>>()?;

        let mut updates = Vec::new();
        for group in &doc.on_execution_state_updates_made {
            for update in &group.state_updates {
                let condition = update.condition.as_deref().map(parse_expr).transpose().map_err(malformed)?;
                if update.has_conditional_updates == Some(false) && condition.is_some() {
                    return Err(CoreError::malformed(
                        action,
                        format!("{} is marked unconditional but has a condition", update.target),
                    ));
                }
                if update.has_conditional_updates == Some(true) && condition.is_none() {
                    return Err(CoreError::malformed(
                        action,
                        format!("{} is marked conditional but has no condition", update.target),
                    ));
                }
                let effect = match &update.effect {
                    EffectDocument::Delta(v) => Effect::Delta(effect_expr(action, v)?),
                    EffectDocument::Set(v) => Effect::Set(effect_expr(action, v)?),
                };
                updates.push(StateUpdate {
                    category: group.category.clone(),
                    target: parse_target(&update.target).map_err(malformed)?,
                    condition,
                    effect,
                });
            }
        }

        let mut rules = Vec::new();
        for group in &doc.post_execution_contract_state_validation_rules {
            for (i, src) in group.rules.iter().enumerate() {
                rules.push(ValidationRule {
                    category: group.category.clone(),
                    label: format!("{} #{}", group.category, i + 1),
                    expr: parse_expr(src).map_err(malformed)?,
                });
            }
        }

        Ok(Self {
            function: doc.function.clone().unwrap_or_else(|| doc.name.clone()),
            name: doc.name.clone(),
            contract: doc.contract.clone(),
            summary: doc.summary.clone(),
            parameters,
            preconditions,
            updates,
            rules,
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> CoreError {
        CoreError::malformed(&self.name, reason)
    }

    /// Checks the model for authoring defects.
    ///
    /// - parameter names are unique, and every `params.X` reference names a
    ///   declared parameter; generation rules may only use earlier ones
    /// - update targets, conditions and effects never read `post`
    /// - conditional updates on the same target are not provably
    ///   overlapping
    pub fn validate_self(&self) -> Result<(), CoreError> {
        let names: Vec<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();

        for (i, param) in self.parameters.iter().enumerate() {
            if names[..i].contains(&param.name.as_str()) {
                return Err(self.malformed(format!("duplicate parameter '{}'", param.name)));
            }
            for expr in param.rule.expressions() {
                if expr.uses_root(&Root::Post) || expr.uses_root(&Root::Outcome) {
                    return Err(self.malformed(format!(
                        "generation rule for '{}' reads post-execution data",
                        param.name
                    )));
                }
                for r in expr.param_refs() {
                    if !names[..i].contains(&r) {
                        return Err(self.malformed(format!(
                            "generation rule for '{}' references '{}', which is not an earlier parameter",
                            param.name, r
                        )));
                    }
                }
            }
        }

        let check_refs = |expr: &Expr, what: &str| -> Result<(), CoreError> {
            for r in expr.param_refs() {
                if !names.contains(&r) {
                    return Err(self.malformed(format!("{} references unknown parameter '{}'", what, r)));
                }
            }
            Ok(())
        };

        for condition in &self.preconditions {
            check_refs(condition, "precondition")?;
            if condition.uses_root(&Root::Post) || condition.uses_root(&Root::Outcome) {
                return Err(self.malformed(format!("precondition reads post-execution data: {}", condition)));
            }
        }

        for update in &self.updates {
            let label = update.label();
            for expr in update.expressions() {
                check_refs(expr, &label)?;
                if expr.uses_root(&Root::Post) {
                    return Err(self.malformed(format!("{} reads post-state", label)));
                }
            }
        }

        for rule in &self.rules {
            check_refs(&rule.expr, &rule.label)?;
        }

        let conditional: Vec<&StateUpdate> = self.updates.iter().filter(|u| u.is_conditional()).collect();
        for (i, a) in conditional.iter().enumerate() {
            for b in &conditional[i + 1..] {
                if a.target == b.target && provably_overlap(a, b) {
                    return Err(self.malformed(format!(
                        "conditional updates on {} overlap: '{}' and '{}'",
                        a.target,
                        a.condition.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                        b.condition.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                    )));
                }
            }
        }

        Ok(())
    }

    /// Draws parameters for this action from the current state.
    pub fn generate_parameters<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        state: &WorldState,
        actor: &AccountAddress,
    ) -> Result<ParameterDraw, CoreError> {
        params::generate(&self.parameters, &self.preconditions, rng, state, actor)
    }
}

/// Two conditional updates provably overlap when one condition's conjuncts
/// are a subset of the other's: whenever the stronger holds, both fire.
/// A stronger condition that contradicts itself never holds.
fn provably_overlap(a: &StateUpdate, b: &StateUpdate) -> bool {
    let (Some(ca), Some(cb)) = (&a.condition, &b.condition) else {
        return false;
    };
    if ca.contradicts(cb) {
        return false;
    }
    let ja = ca.conjuncts();
    let jb = cb.conjuncts();
    ja.iter().all(|x| jb.contains(x)) || jb.iter().all(|x| ja.contains(x))
}

/// The set of actions available to a run, keyed by action name.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalogue {
    actions: BTreeMap<String, ActionModel>,
}

impl ActionCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model; duplicate action names are malformed.
    pub fn insert(&mut self, model: ActionModel) -> Result<(), CoreError> {
        if self.actions.contains_key(&model.name) {
            return Err(CoreError::malformed(&model.name, "duplicate action name"));
        }
        self.actions.insert(model.name.clone(), model);
        Ok(())
    }

    /// Loads a catalogue from JSON: a single document, an array of
    /// documents, or `{"actions": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| CoreError::malformed("<catalogue>", e.to_string()))?;
        let documents = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut obj) if obj.contains_key("actions") => {
                match obj.remove("actions") {
                    Some(serde_json::Value::Array(items)) => items,
                    _ => return Err(CoreError::malformed("<catalogue>", "'actions' must be an array")),
                }
            }
            single => vec![single],
        };

        let mut catalogue = Self::new();
        for doc in documents {
            catalogue.insert(ActionModel::from_value(doc)?)?;
        }
        Ok(catalogue)
    }

    pub fn get(&self, name: &str) -> Option<&ActionModel> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionModel> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BORROW: &str = r#"{
        "name": "borrow",
        "contract": "CDP",
        "summary": "borrow against a safe",
        "reviewer_notes": "ignored",
        "pre_execution_parameter_generation_rules": [
            {"name": "safeId", "rule": {"kind": "existing", "source": "CDP.safes"}},
            {"name": "amount", "rule": {"kind": "range", "min": 1, "max": 100}}
        ],
        "on_execution_state_updates_made": [
            {"category": "Safe", "state_updates": [
                {"target": "CDP.safes[params.safeId].borrowedAmount", "has_conditional_updates": false,
                 "effect": {"delta": "params.amount"}},
                {"target": "CDP.mode", "has_conditional_updates": true,
                 "condition": "pre.CDP.mode == \"BOOTSTRAP\" && pre.CDP.totalDebt + params.amount >= pre.CDP.threshold",
                 "effect": {"set": "\"NORMAL\""}}
            ]}
        ],
        "post_execution_contract_state_validation_rules": [
            {"category": "Debt", "rules": ["post.CDP.totalDebt == pre.CDP.totalDebt + params.amount"]}
        ]
    }"#;

    fn with(edit: impl FnOnce(&mut serde_json::Value)) -> Result<ActionModel, CoreError> {
        let mut doc: serde_json::Value = serde_json::from_str(BORROW).unwrap();
        edit(&mut doc);
        ActionModel::from_value(doc)
    }

    #[test]
    fn test_loads_and_ignores_unknown_fields() {
        let model = ActionModel::from_json(BORROW).unwrap();
        assert_eq!(model.name, "borrow");
        assert_eq!(model.function, "borrow");
        assert_eq!(model.parameters.len(), 2);
        assert_eq!(model.updates.len(), 2);
        assert_eq!(model.rules[0].label, "Debt #1");
        assert!(model.updates[1].is_conditional());
    }

    #[test]
    fn test_missing_required_field() {
        let err = with(|d| {
            d.as_object_mut().unwrap().remove("contract");
        })
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedActionModel { ref action, .. } if action == "borrow"));
    }

    #[test]
    fn test_free_text_condition_rejected() {
        let err = with(|d| {
            d["on_execution_state_updates_made"][0]["state_updates"][1]["condition"] =
                "if the protocol is still bootstrapping".into();
        })
        .unwrap_err();
        assert!(matches!(err, CoreError::MalformedActionModel { .. }));
    }

    #[test]
    fn test_unknown_parameter_reference() {
        let err = with(|d| {
            d["post_execution_contract_state_validation_rules"][0]["rules"][0] =
                "post.CDP.totalDebt == params.amnt".into();
        })
        .unwrap_err();
        assert!(err.to_string().contains("amnt"));
    }

    #[test]
    fn test_bound_referencing_later_parameter() {
        let err = with(|d| {
            d["pre_execution_parameter_generation_rules"][0]["rule"] =
                serde_json::json!({"kind": "range", "min": 0, "max": "params.amount"});
        })
        .unwrap_err();
        assert!(err.to_string().contains("earlier parameter"));
    }

    #[test]
    fn test_post_in_update_rejected() {
        let err = with(|d| {
            d["on_execution_state_updates_made"][0]["state_updates"][0]["effect"] =
                serde_json::json!({"delta": "post.CDP.totalDebt"});
        })
        .unwrap_err();
        assert!(err.to_string().contains("post-state"));
    }

    #[test]
    fn test_unconditional_with_condition_rejected() {
        let err = with(|d| {
            d["on_execution_state_updates_made"][0]["state_updates"][0]["condition"] = "true".into();
        })
        .unwrap_err();
        assert!(err.to_string().contains("unconditional"));
    }

    #[test]
    fn test_overlapping_branches_rejected() {
        let err = with(|d| {
            let updates = d["on_execution_state_updates_made"][0]["state_updates"].as_array_mut().unwrap();
            updates.push(serde_json::json!({
                "target": "CDP.mode", "has_conditional_updates": true,
                "condition": "pre.CDP.mode == \"BOOTSTRAP\"",
                "effect": {"set": "\"PAUSED\""}
            }));
        })
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));

        // mutually exclusive branch is fine
        with(|d| {
            let updates = d["on_execution_state_updates_made"][0]["state_updates"].as_array_mut().unwrap();
            updates.push(serde_json::json!({
                "target": "CDP.mode", "has_conditional_updates": true,
                "condition": "pre.CDP.mode == \"NORMAL\"",
                "effect": {"set": "\"NORMAL\""}
            }));
        })
        .unwrap();
    }

    #[test]
    fn test_catalogue_forms() {
        let single = ActionCatalogue::from_json(BORROW).unwrap();
        assert_eq!(single.len(), 1);

        let wrapped = format!(r#"{{"actions": [{}]}}"#, BORROW);
        let catalogue = ActionCatalogue::from_json(&wrapped).unwrap();
        assert!(catalogue.contains("borrow"));

        let duplicated = format!("[{}, {}]", BORROW, BORROW);
        assert!(ActionCatalogue::from_json(&duplicated).is_err());
    }
}
