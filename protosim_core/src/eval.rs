//! Rule Expression Evaluator.
//!
//! Evaluates an [`Expr`] against a binding environment of pre/post world
//! states, generated parameters, the execution outcome and the acting
//! account. All integer arithmetic is arbitrary precision.

use crate::error::CoreError;
use crate::expr::{BinaryOp, Builtin, Expr, UnaryOp};
use crate::outcome::ExecutionOutcome;
use crate::params::Parameters;
use crate::path::{FieldPath, Root, Segment, StatePath};
use crate::snapshot::WorldState;
use num_bigint::BigInt;
use num_traits::Zero;
use protosim_env::{AccountAddress, Value};

/// Everything a rule may refer to.
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    pub pre: &'a WorldState,
    pub post: Option<&'a WorldState>,
    pub params: &'a Parameters,
    pub outcome: Option<&'a ExecutionOutcome>,
    pub actor: Option<&'a AccountAddress>,
    /// State that bare paths (update targets, entity sources) resolve in;
    /// defaults to `pre`
    pub state: Option<&'a WorldState>,
    pub locals: Vec<(String, Value)>,
}

impl<'a> Bindings<'a> {
    /// Bindings over a pre-state and parameters only.
    pub fn new(pre: &'a WorldState, params: &'a Parameters) -> Self {
        Self {
            pre,
            post: None,
            params,
            outcome: None,
            actor: None,
            state: None,
            locals: Vec::new(),
        }
    }

    pub fn with_post(mut self, post: &'a WorldState) -> Self {
        self.post = Some(post);
        self
    }

    pub fn with_outcome(mut self, outcome: &'a ExecutionOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_actor(mut self, actor: &'a AccountAddress) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_state(mut self, state: &'a WorldState) -> Self {
        self.state = Some(state);
        self
    }

    /// Binds a local (`key`, `entry`), shadowing any earlier binding.
    pub fn with_local(mut self, name: &str, value: Value) -> Self {
        self.locals.retain(|(n, _)| n != name);
        self.locals.push((name.to_string(), value));
        self
    }

    fn world(&self, root: &Root) -> Option<&'a WorldState> {
        match root {
            Root::Pre => Some(self.pre),
            Root::Post => self.post,
            Root::State => Some(self.state.unwrap_or(self.pre)),
            _ => None,
        }
    }
}

/// Resolves the index segments of `path` into concrete keys.
///
/// The first key of a bare or pre/post path is the contract name (or
/// `accounts`); for `params` it is the parameter name.
pub fn resolve_keys(path: &StatePath, bindings: &Bindings<'_>) -> Result<FieldPath, CoreError> {
    let mut keys = Vec::with_capacity(path.segments.len());
    for segment in &path.segments {
        match segment {
            Segment::Field(name) => keys.push(name.clone()),
            Segment::Index(expr) => {
                let value = eval(expr, bindings)?;
                let key = value
                    .key()
                    .ok_or_else(|| CoreError::type_mismatch("scalar index", value.type_name()))?;
                keys.push(key);
            }
        }
    }
    Ok(FieldPath::new(keys))
}

/// Resolves `path` to the value it addresses.
pub fn lookup(path: &StatePath, bindings: &Bindings<'_>) -> Result<Value, CoreError> {
    let keys = resolve_keys(path, bindings)?;
    let missing = || CoreError::unresolved(path);

    match &path.root {
        Root::Pre | Root::Post | Root::State => {
            let world = bindings.world(&path.root).ok_or_else(missing)?;
            world.lookup(keys.keys()).cloned().ok_or_else(missing)
        }
        Root::Params => {
            let (name, rest) = keys.keys().split_first().ok_or_else(missing)?;
            let value = bindings.params.get(name).ok_or_else(missing)?;
            descend(value, rest).ok_or_else(missing)
        }
        Root::Outcome => {
            let outcome = bindings.outcome.ok_or_else(missing)?;
            let (name, rest) = keys.keys().split_first().ok_or_else(missing)?;
            let value = outcome.field(name).ok_or_else(missing)?;
            descend(&value, rest).ok_or_else(missing)
        }
        Root::Actor => match (bindings.actor, keys.keys().is_empty()) {
            (Some(actor), true) => Ok(Value::from(actor.clone())),
            _ => Err(missing()),
        },
        Root::Local(name) => {
            let (_, value) = bindings
                .locals
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .ok_or_else(missing)?;
            descend(value, keys.keys()).ok_or_else(missing)
        }
    }
}

fn descend(value: &Value, keys: &[String]) -> Option<Value> {
    let mut current = value;
    for key in keys {
        current = current.child(key)?;
    }
    Some(current.clone())
}

/// Evaluates an expression to a value.
pub fn eval(expr: &Expr, bindings: &Bindings<'_>) -> Result<Value, CoreError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => lookup(path, bindings),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!eval_bool(inner, bindings)?)),
        Expr::Unary(UnaryOp::Neg, inner) => Ok(Value::Int(-eval_int(inner, bindings)?)),
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            Ok(Value::Bool(eval_bool(lhs, bindings)? && eval_bool(rhs, bindings)?))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            Ok(Value::Bool(eval_bool(lhs, bindings)? || eval_bool(rhs, bindings)?))
        }
        Expr::Binary(op @ (BinaryOp::Eq | BinaryOp::Ne), lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            if l.type_name() != r.type_name() {
                return Err(CoreError::type_mismatch(l.type_name(), r.type_name()));
            }
            Ok(Value::Bool((l == r) == (*op == BinaryOp::Eq)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_int(lhs, bindings)?;
            let r = eval_int(rhs, bindings)?;
            arithmetic(*op, l, r, expr)
        }
        Expr::Call(Builtin::Exists, args) => match &args[..] {
            [Expr::Path(path)] => match lookup(path, bindings) {
                Ok(_) => Ok(Value::Bool(true)),
                Err(CoreError::UnresolvedReference { .. }) => Ok(Value::Bool(false)),
                Err(e) => Err(e),
            },
            _ => Err(CoreError::type_mismatch("path", "expression")),
        },
        Expr::Call(builtin, args) => {
            let (a, b) = match &args[..] {
                [a, b] => (eval_int(a, bindings)?, eval_int(b, bindings)?),
                _ => return Err(CoreError::type_mismatch("two arguments", format!("{}", args.len()))),
            };
            Ok(Value::Int(match builtin {
                Builtin::Min => a.min(b),
                _ => a.max(b),
            }))
        }
    }
}

fn arithmetic(op: BinaryOp, l: BigInt, r: BigInt, expr: &Expr) -> Result<Value, CoreError> {
    let value = match op {
        BinaryOp::Add => Value::Int(l + r),
        BinaryOp::Sub => Value::Int(l - r),
        BinaryOp::Mul => Value::Int(l * r),
        BinaryOp::Div | BinaryOp::Mod if r.is_zero() => {
            return Err(CoreError::DivisionByZero {
                expr: expr.to_string(),
            })
        }
        // BigInt division truncates toward zero
        BinaryOp::Div => Value::Int(l / r),
        BinaryOp::Mod => Value::Int(l % r),
        BinaryOp::Lt => Value::Bool(l < r),
        BinaryOp::Le => Value::Bool(l <= r),
        BinaryOp::Gt => Value::Bool(l > r),
        BinaryOp::Ge => Value::Bool(l >= r),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => {
            return Err(CoreError::type_mismatch("arithmetic operator", op.symbol()))
        }
    };
    Ok(value)
}

/// Evaluates an expression that must produce a boolean.
pub fn eval_bool(expr: &Expr, bindings: &Bindings<'_>) -> Result<bool, CoreError> {
    match eval(expr, bindings)? {
        Value::Bool(b) => Ok(b),
        other => Err(CoreError::type_mismatch("bool", other.type_name())),
    }
}

/// Evaluates an expression that must produce an integer.
pub fn eval_int(expr: &Expr, bindings: &Bindings<'_>) -> Result<BigInt, CoreError> {
    match eval(expr, bindings)? {
        Value::Int(i) => Ok(i),
        other => Err(CoreError::type_mismatch("int", other.type_name())),
    }
}
