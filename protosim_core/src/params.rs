//! Parameter generation rules and concrete parameter sets.

use crate::error::CoreError;
use crate::eval::{eval_bool, eval_int, lookup, Bindings};
use crate::expr::Expr;
use crate::parser::{parse_expr, parse_target};
use crate::path::{Segment, StatePath};
use crate::snapshot::WorldState;
use num_bigint::{BigInt, RandBigInt};
use protosim_env::{AccountAddress, Value};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Concrete arguments for one action, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Vec<(String, Value)>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter; a later value for the same name replaces the
    /// earlier one.
    pub fn push(&mut self, name: &str, value: Value) {
        self.0.retain(|(n, _)| n != name);
        self.0.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts into call arguments.
    pub fn into_args(self) -> Vec<(String, Value)> {
        self.0
    }
}

impl std::fmt::Display for Parameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, ")")
    }
}

/// Generation rule as written in an action model document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleDocument {
    /// Inclusive integer range; bounds are integers or expressions
    Range { min: Value, max: Value },
    /// A key of the mapping at `source`, optionally filtered
    Existing {
        source: String,
        #[serde(default)]
        filter: Option<String>,
    },
    OneOf { values: Vec<Value> },
    Constant { value: Value },
    ActorAddress,
    Boolean,
}

/// A compiled generation rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterRule {
    Range { min: Expr, max: Expr },
    Existing { source: StatePath, filter: Option<Expr> },
    OneOf(Vec<Value>),
    Constant(Value),
    ActorAddress,
    Boolean,
}

impl ParameterRule {
    /// Compiles a document rule, parsing every embedded expression.
    pub fn compile(action: &str, doc: &RuleDocument) -> Result<Self, CoreError> {
        let malformed = |e: CoreError| CoreError::malformed(action, e.to_string());
        Ok(match doc {
            RuleDocument::Range { min, max } => ParameterRule::Range {
                min: bound(action, min)?,
                max: bound(action, max)?,
            },
            RuleDocument::Existing { source, filter } => ParameterRule::Existing {
                source: parse_target(source).map_err(malformed)?,
                filter: filter.as_deref().map(parse_expr).transpose().map_err(malformed)?,
            },
            RuleDocument::OneOf { values } if values.is_empty() => {
                return Err(CoreError::malformed(action, "one_of with no values"))
            }
            RuleDocument::OneOf { values } => ParameterRule::OneOf(values.clone()),
            RuleDocument::Constant { value } => ParameterRule::Constant(value.clone()),
            RuleDocument::ActorAddress => ParameterRule::ActorAddress,
            RuleDocument::Boolean => ParameterRule::Boolean,
        })
    }

    /// Expressions embedded in the rule.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            ParameterRule::Range { min, max } => vec![min, max],
            ParameterRule::Existing { source, filter } => {
                let mut out: Vec<&Expr> = source
                    .segments
                    .iter()
                    .filter_map(|s| match s {
                        Segment::Index(e) => Some(e),
                        _ => None,
                    })
                    .collect();
                out.extend(filter.iter());
                out
            }
            _ => Vec::new(),
        }
    }
}

fn bound(action: &str, value: &Value) -> Result<Expr, CoreError> {
    match value {
        Value::Int(_) => Ok(Expr::Literal(value.clone())),
        Value::Text(src) => {
            parse_expr(src).map_err(|e| CoreError::malformed(action, e.to_string()))
        }
        other => Err(CoreError::malformed(
            action,
            format!("range bound must be an integer or expression, got {}", other.type_name()),
        )),
    }
}

/// A named parameter and its generation rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConstraint {
    pub name: String,
    pub rule: ParameterRule,
}

/// Result of parameter generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterDraw {
    Ready(Parameters),
    /// No valid assignment exists in the current state; not an error
    NoEligibleParameters { reason: String },
}

impl ParameterDraw {
    fn none(reason: impl Into<String>) -> Self {
        ParameterDraw::NoEligibleParameters {
            reason: reason.into(),
        }
    }
}

/// Maps a mapping key back onto a value: decimal keys are integers.
fn key_value(key: &str) -> Value {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = key.parse::<BigInt>() {
            return Value::Int(i);
        }
    }
    Value::text(key)
}

/// Draws concrete parameters satisfying `constraints` in order, then checks
/// `preconditions`.
///
/// Entity references are sampled only from keys visible in `state`.
/// Unresolved references while sampling mean "nothing eligible"; other
/// evaluation errors are authoring errors and propagate.
pub fn generate<R: Rng + ?Sized>(
    constraints: &[ParameterConstraint],
    preconditions: &[Expr],
    rng: &mut R,
    state: &WorldState,
    actor: &AccountAddress,
) -> Result<ParameterDraw, CoreError> {
    let mut params = Parameters::new();

    for constraint in constraints {
        let bindings = Bindings::new(state, &params).with_actor(actor);
        let value = match &constraint.rule {
            ParameterRule::Range { min, max } => {
                let lo = match soft(eval_int(min, &bindings))? {
                    Some(v) => v,
                    None => return Ok(ParameterDraw::none(format!("{}: bound unresolved", constraint.name))),
                };
                let hi = match soft(eval_int(max, &bindings))? {
                    Some(v) => v,
                    None => return Ok(ParameterDraw::none(format!("{}: bound unresolved", constraint.name))),
                };
                if lo > hi {
                    return Ok(ParameterDraw::none(format!(
                        "{}: empty range [{}, {}]",
                        constraint.name, lo, hi
                    )));
                }
                Value::Int(rng.gen_bigint_range(&lo, &(hi + 1)))
            }
            ParameterRule::Existing { source, filter } => {
                let mapping = match soft(lookup(source, &bindings))? {
                    Some(Value::Map(m)) => m,
                    Some(other) => {
                        return Err(CoreError::type_mismatch("map", other.type_name()));
                    }
                    None => BTreeMap::new(),
                };
                let mut eligible = Vec::new();
                for (key, entry) in &mapping {
                    let keep = match filter {
                        None => true,
                        Some(f) => {
                            let scoped = bindings
                                .clone()
                                .with_local("key", key_value(key))
                                .with_local("entry", entry.clone());
                            soft(eval_bool(f, &scoped))?.unwrap_or(false)
                        }
                    };
                    if keep {
                        eligible.push(key);
                    }
                }
                if eligible.is_empty() {
                    return Ok(ParameterDraw::none(format!(
                        "{}: no eligible entry in {}",
                        constraint.name, source
                    )));
                }
                key_value(eligible[rng.gen_range(0..eligible.len())])
            }
            ParameterRule::OneOf(values) => values[rng.gen_range(0..values.len())].clone(),
            ParameterRule::Constant(value) => value.clone(),
            ParameterRule::ActorAddress => Value::from(actor.clone()),
            ParameterRule::Boolean => Value::Bool(rng.gen_bool(0.5)),
        };
        params.push(&constraint.name, value);
    }

    let bindings = Bindings::new(state, &params).with_actor(actor);
    for condition in preconditions {
        if !soft(eval_bool(condition, &bindings))?.unwrap_or(false) {
            return Ok(ParameterDraw::none(format!("precondition not met: {}", condition)));
        }
    }

    Ok(ParameterDraw::Ready(params))
}

/// Turns an unresolved reference into `None`, keeping other errors.
fn soft<T>(result: Result<T, CoreError>) -> Result<Option<T>, CoreError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(CoreError::UnresolvedReference { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn constraint(name: &str, json: &str) -> ParameterConstraint {
        let doc: RuleDocument = serde_json::from_str(json).unwrap();
        ParameterConstraint {
            name: name.into(),
            rule: ParameterRule::compile("test", &doc).unwrap(),
        }
    }

    fn state() -> WorldState {
        let cdp: Value = serde_json::from_str(
            r#"{"maxBorrow": 50, "safes": {
                "1": {"owner": "0xaa", "collateral": 100},
                "2": {"owner": "0xbb", "collateral": 100},
                "7": {"owner": "0xaa", "collateral": 0}}}"#,
        )
        .unwrap();
        let mut s = WorldState::default();
        s.contracts.insert("CDP".into(), cdp);
        s
    }

    #[test]
    fn test_range_with_expression_bounds() {
        let constraints = vec![
            constraint("a", r#"{"kind": "range", "min": 1, "max": "pre.CDP.maxBorrow"}"#),
            constraint("b", r#"{"kind": "range", "min": "params.a", "max": "params.a"}"#),
        ];
        let actor = AccountAddress::parse("0xaa");
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..50 {
            match generate(&constraints, &[], &mut rng, &state(), &actor).unwrap() {
                ParameterDraw::Ready(p) => {
                    let a = p.get("a").unwrap().as_int().unwrap().clone();
                    assert!(a >= BigInt::from(1) && a <= BigInt::from(50));
                    assert_eq!(p.get("b"), p.get("a"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_existing_respects_filter_and_state() {
        let constraints = vec![constraint(
            "safeId",
            r#"{"kind": "existing", "source": "CDP.safes",
                "filter": "entry.owner == actor && entry.collateral > 0"}"#,
        )];
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let owner = AccountAddress::parse("0xaa");
        for _ in 0..20 {
            let draw = generate(&constraints, &[], &mut rng, &state(), &owner).unwrap();
            assert_eq!(draw, ParameterDraw::Ready({
                let mut p = Parameters::new();
                p.push("safeId", Value::int(1));
                p
            }));
        }

        let stranger = AccountAddress::parse("0xcc");
        let draw = generate(&constraints, &[], &mut rng, &state(), &stranger).unwrap();
        assert!(matches!(draw, ParameterDraw::NoEligibleParameters { .. }));

        let draw = generate(&constraints, &[], &mut rng, &WorldState::default(), &owner).unwrap();
        assert!(matches!(draw, ParameterDraw::NoEligibleParameters { .. }));
    }

    #[test]
    fn test_preconditions_gate_draw() {
        let constraints = vec![constraint("x", r#"{"kind": "one_of", "values": [1, 2, 3]}"#)];
        let pre = vec![parse_expr("params.x > 5").unwrap()];
        let actor = AccountAddress::parse("0xaa");
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let draw = generate(&constraints, &pre, &mut rng, &state(), &actor).unwrap();
        assert!(matches!(draw, ParameterDraw::NoEligibleParameters { .. }));
    }

    #[test]
    fn test_same_seed_same_draw() {
        let constraints = vec![
            constraint("amount", r#"{"kind": "range", "min": 0, "max": "1e30"}"#),
            constraint("flag", r#"{"kind": "boolean"}"#),
            constraint("who", r#"{"kind": "actor_address"}"#),
        ];
        let actor = AccountAddress::parse("0xaa");
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            generate(&constraints, &[], &mut rng, &state(), &actor).unwrap()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_compile_rejects_bad_rules() {
        let doc: RuleDocument = serde_json::from_str(r#"{"kind": "one_of", "values": []}"#).unwrap();
        assert!(ParameterRule::compile("a", &doc).is_err());
        let doc: RuleDocument =
            serde_json::from_str(r#"{"kind": "range", "min": 0, "max": "amount plus one"}"#).unwrap();
        assert!(matches!(
            ParameterRule::compile("a", &doc),
            Err(CoreError::MalformedActionModel { .. })
        ));
    }
}
