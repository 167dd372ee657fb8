//! Protocol-wide invariants, checked after every executed step.
//!
//! Three kinds:
//! - boolean rules over `pre`/`post`/`params`/`outcome`
//! - finite-state transition tables for mode fields (`BOOTSTRAP -> NORMAL`)
//! - linked-queue structure checks (see [`crate::queue`])

use crate::error::CoreError;
use crate::eval::{eval_bool, lookup, Bindings};
use crate::expr::Expr;
use crate::parser::{parse_expr, parse_target};
use crate::path::StatePath;
use crate::queue::{check_queue, QueueOrder};
use crate::validation::{RuleKind, RuleResult};
use protosim_env::Value;
use serde::Deserialize;

const DOCUMENT: &str = "<invariants>";

#[derive(Debug, Deserialize)]
struct InvariantsDocument {
    #[serde(default)]
    invariants: Vec<RuleDocument>,
    #[serde(default)]
    transitions: Vec<TransitionDocument>,
    #[serde(default)]
    queues: Vec<QueueDocument>,
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    label: String,
    rule: String,
}

#[derive(Debug, Deserialize)]
struct TransitionDocument {
    field: String,
    allowed: Vec<(Value, Value)>,
}

#[derive(Debug, Deserialize)]
struct QueueDocument {
    label: String,
    path: String,
    #[serde(default = "default_order")]
    order: QueueOrder,
}

fn default_order() -> QueueOrder {
    QueueOrder::Ascending
}

/// A named boolean invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantRule {
    pub label: String,
    pub expr: Expr,
}

/// Allowed changes of a finite-state field. Unchanged is always allowed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRule {
    pub field: StatePath,
    pub allowed: Vec<(Value, Value)>,
}

/// A linked queue whose structure is checked in the post-state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRule {
    pub label: String,
    pub path: StatePath,
    pub order: QueueOrder,
}

/// All protocol-wide invariants for a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolInvariants {
    pub rules: Vec<InvariantRule>,
    pub transitions: Vec<TransitionRule>,
    pub queues: Vec<QueueRule>,
}

impl ProtocolInvariants {
    /// Parses an invariants document.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let doc: InvariantsDocument =
            serde_json::from_str(json).map_err(|e| CoreError::malformed(DOCUMENT, e.to_string()))?;
        let malformed = |e: CoreError| CoreError::malformed(DOCUMENT, e.to_string());

        let rules = doc
            .invariants
            .iter()
            .map(|r| {
                Ok(InvariantRule {
                    label: r.label.clone(),
                    expr: parse_expr(&r.rule).map_err(malformed)?,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let transitions = doc
            .transitions
            .iter()
            .map(|t| {
                Ok(TransitionRule {
                    field: parse_target(&t.field).map_err(malformed)?,
                    allowed: t.allowed.clone(),
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let queues = doc
            .queues
            .iter()
            .map(|q| {
                Ok(QueueRule {
                    label: q.label.clone(),
                    path: parse_target(&q.path).map_err(malformed)?,
                    order: q.order,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        for rule in &rules {
            if !rule.expr.param_refs().is_empty() {
                return Err(CoreError::malformed(
                    DOCUMENT,
                    format!("invariant '{}' references action parameters", rule.label),
                ));
            }
        }

        Ok(Self {
            rules,
            transitions,
            queues,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.transitions.is_empty() && self.queues.is_empty()
    }

    /// Evaluates every invariant. `bindings` must carry both `pre` and
    /// `post`.
    pub fn check(&self, bindings: &Bindings<'_>) -> Vec<RuleResult> {
        let mut results = Vec::new();

        for rule in &self.rules {
            results.push(match eval_bool(&rule.expr, bindings) {
                Ok(true) => RuleResult::satisfied(&rule.label, RuleKind::Invariant),
                Ok(false) => RuleResult::violated(&rule.label, RuleKind::Invariant, rule.expr.to_string()),
                Err(e) => RuleResult::authoring(&rule.label, RuleKind::Invariant, e),
            });
        }

        if let Some(post) = bindings.post {
            for transition in &self.transitions {
                let label = format!("transition {}", transition.field);
                let before = lookup(&transition.field, &bindings.clone().with_state(bindings.pre));
                let after = lookup(&transition.field, &bindings.clone().with_state(post));
                results.push(match (before, after) {
                    (Ok(from), Ok(to)) if from == to => RuleResult::satisfied(&label, RuleKind::Transition),
                    (Ok(from), Ok(to)) => {
                        if transition.allowed.iter().any(|(a, b)| a == &from && b == &to) {
                            RuleResult::satisfied(&label, RuleKind::Transition)
                        } else {
                            RuleResult::violated(
                                &label,
                                RuleKind::Transition,
                                format!("{} -> {} is not an allowed transition", from, to),
                            )
                        }
                    }
                    (Err(e), _) | (_, Err(e)) => RuleResult::authoring(&label, RuleKind::Transition, e),
                });
            }

            for queue in &self.queues {
                let scoped = bindings.clone().with_state(post);
                results.push(match lookup(&queue.path, &scoped) {
                    Ok(value) => {
                        let problems = check_queue(&value, queue.order);
                        if problems.is_empty() {
                            RuleResult::satisfied(&queue.label, RuleKind::Queue)
                        } else {
                            RuleResult::violated(&queue.label, RuleKind::Queue, problems.join("; "))
                        }
                    }
                    Err(e) => RuleResult::authoring(&queue.label, RuleKind::Queue, e),
                });
            }
        }

        results
    }
}
