//! Deployment descriptor consumed by a [`DeploymentService`](crate::DeploymentService).

use crate::error::EnvError;
use crate::types::{ContractHandle, Value};
use serde::{Deserialize, Serialize};

/// Ordered deployment plan for the contracts under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Steps, executed strictly in order
    #[serde(alias = "sequence")]
    pub steps: Vec<DeploymentStep>,
}

/// One step of a deployment plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStep {
    /// Deploy a new contract under the given reference name.
    #[serde(alias = "deploy")]
    Contract {
        contract: String,
        /// Contract kind; defaults to the reference name
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        params: Vec<DeploymentParam>,
    },

    /// Call a method on an already deployed contract.
    #[serde(alias = "call")]
    Transaction {
        contract: String,
        method: String,
        #[serde(default)]
        params: Vec<DeploymentParam>,
    },
}

/// A constructor or call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentParam {
    /// Optional argument name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub source: ParamSource,
}

/// Where an argument value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamSource {
    /// Address of a previously deployed contract, by reference name
    Ref { value: String },

    /// A literal value
    Val { value: Value },
}

impl DeploymentStep {
    /// Reference name of the contract this step deploys or calls.
    pub fn contract(&self) -> &str {
        match self {
            DeploymentStep::Contract { contract, .. } => contract,
            DeploymentStep::Transaction { contract, .. } => contract,
        }
    }

    /// Arguments of this step.
    pub fn params(&self) -> &[DeploymentParam] {
        match self {
            DeploymentStep::Contract { params, .. } => params,
            DeploymentStep::Transaction { params, .. } => params,
        }
    }
}

impl DeploymentDescriptor {
    /// Parses a descriptor from JSON.
    pub fn from_json(json: &str) -> Result<Self, EnvError> {
        serde_json::from_str(json).map_err(|e| EnvError::SerializationError(e.to_string()))
    }

    /// Checks that every `ref` names a contract deployed by an earlier step,
    /// and that transactions only target deployed contracts.
    pub fn check_references(&self) -> Result<(), EnvError> {
        let mut deployed: Vec<&str> = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            for param in step.params() {
                if let ParamSource::Ref { value } = &param.source {
                    if !deployed.contains(&value.as_str()) {
                        return Err(EnvError::deployment(format!(
                            "step {}: reference to '{}' before it is deployed",
                            index, value
                        )));
                    }
                }
            }
            match step {
                DeploymentStep::Contract { contract, .. } => deployed.push(contract),
                DeploymentStep::Transaction { contract, .. } => {
                    if !deployed.contains(&contract.as_str()) {
                        return Err(EnvError::deployment(format!(
                            "step {}: transaction on undeployed contract '{}'",
                            index, contract
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolves step arguments against the contracts deployed so far.
///
/// `ref` arguments become the referenced contract's address.
pub fn resolve_params(
    params: &[DeploymentParam],
    deployed: &[ContractHandle],
) -> Result<Vec<(Option<String>, Value)>, EnvError> {
    params
        .iter()
        .map(|param| {
            let value = match &param.source {
                ParamSource::Val { value } => value.clone(),
                ParamSource::Ref { value } => deployed
                    .iter()
                    .find(|c| &c.name == value)
                    .map(|c| Value::from(c.address.clone()))
                    .ok_or_else(|| EnvError::deployment(format!("unknown contract reference '{}'", value)))?,
            };
            Ok((param.name.clone(), value))
        })
        .collect()
}
