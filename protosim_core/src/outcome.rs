//! Execution outcome of one action.

use protosim_env::{CallReceipt, CallStatus, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happened when an action was executed.
///
/// `Reverted` is expected domain behavior and is recorded like any other
/// step. `InfrastructureError` is fatal to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        outputs: BTreeMap<String, Value>,
    },
    Reverted {
        reason: String,
    },
    InfrastructureError {
        message: String,
    },
}

impl ExecutionOutcome {
    /// Returns true for a successful call.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Returns true for a reverted call.
    pub fn is_reverted(&self) -> bool {
        matches!(self, ExecutionOutcome::Reverted { .. })
    }

    /// Resolves `outcome.<name>` for rule evaluation.
    ///
    /// `success`, `reverted` and `reason` are reserved; any other name is a
    /// named output of a successful call.
    pub fn field(&self, name: &str) -> Option<Value> {
        match (name, self) {
            ("success", _) => Some(Value::Bool(self.is_success())),
            ("reverted", _) => Some(Value::Bool(self.is_reverted())),
            ("reason", ExecutionOutcome::Reverted { reason }) => Some(Value::text(reason.as_str())),
            ("reason", ExecutionOutcome::InfrastructureError { message }) => {
                Some(Value::text(message.as_str()))
            }
            (_, ExecutionOutcome::Success { outputs }) => outputs.get(name).cloned(),
            _ => None,
        }
    }

    /// Short label for logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::Reverted { .. } => "reverted",
            ExecutionOutcome::InfrastructureError { .. } => "infrastructure_error",
        }
    }
}

impl From<CallReceipt> for ExecutionOutcome {
    fn from(receipt: CallReceipt) -> Self {
        match receipt.status {
            CallStatus::Success => ExecutionOutcome::Success {
                outputs: receipt.outputs,
            },
            CallStatus::Reverted { reason } => ExecutionOutcome::Reverted { reason },
        }
    }
}
