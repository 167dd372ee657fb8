//! Action executor: submits one selected action to the environment.

use protosim_core::{ActionModel, ExecutionOutcome, Parameters};
use protosim_env::{AccountAddress, CallRequest, ExecutionEnvironment};
use std::sync::Arc;
use tracing::{debug, error};

/// Turns (action model, parameters, sender) into a call and classifies the
/// result. Never retries: a retried call could double-apply state changes.
pub struct ActionExecutor {
    env: Arc<dyn ExecutionEnvironment>,
}

impl ActionExecutor {
    pub fn new(env: Arc<dyn ExecutionEnvironment>) -> Self {
        Self { env }
    }

    /// Executes the action exactly once.
    pub async fn execute(
        &self,
        model: &ActionModel,
        params: &Parameters,
        sender: &AccountAddress,
    ) -> ExecutionOutcome {
        let request = CallRequest {
            contract: model.contract.clone(),
            method: model.function.clone(),
            sender: sender.clone(),
            args: params.clone().into_args(),
        };

        match self.env.execute(request).await {
            Ok(receipt) => {
                let outcome = ExecutionOutcome::from(receipt);
                debug!("{}.{} -> {}", model.contract, model.function, outcome.label());
                outcome
            }
            Err(e) => {
                error!("Infrastructure fault executing '{}': {}", model.name, e);
                ExecutionOutcome::InfrastructureError { message: e.to_string() }
            }
        }
    }
}
