//! Error types for the protosim environment abstraction.

use thiserror::Error;

/// Infrastructure faults raised by an execution environment.
///
/// Every variant is fatal to a simulation run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    /// The environment cannot be reached (connection refused, node down)
    #[error("Environment unreachable: {0}")]
    Unreachable(String),

    /// The environment answered with something other than a receipt
    #[error("RPC error: {0}")]
    RpcError(String),

    /// A deployment step failed
    #[error("Deployment error: {0}")]
    DeploymentError(String),

    /// Reading contract or account state failed
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates an unreachable error.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Creates an RPC error.
    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::RpcError(msg.into())
    }

    /// Creates a deployment error.
    pub fn deployment(msg: impl Into<String>) -> Self {
        Self::DeploymentError(msg.into())
    }

    /// Creates a snapshot error.
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::SnapshotError(msg.into())
    }
}
