//! Execution environment abstraction for protosim runs.

use async_trait::async_trait;
use crate::deployment::DeploymentDescriptor;
use crate::error::EnvError;
use crate::types::{AccountAddress, CallReceipt, CallRequest, ContractHandle, Value};
use num_bigint::BigInt;
use std::collections::BTreeMap;

/// Abstraction over a live contract deployment.
///
/// # Implementations
///
/// - **Live**: a node connection that signs and submits transactions
/// - **Simulation**: an in-memory protocol model with fault injection
///
/// # Call Flow
///
/// ```text
/// Executor                   Environment                 Contracts
///   |                             |                           |
///   |-- execute(request) -------->|                           |
///   |                             |-- submit + wait --------->|
///   |<-- Ok(receipt) / Err(e) ----|                           |
/// ```
///
/// A reverted call is a successful `execute` whose receipt carries
/// [`CallStatus::Reverted`](crate::CallStatus::Reverted). `Err` is reserved
/// for infrastructure faults.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Submits a state-mutating call and waits for its receipt.
    async fn execute(&self, request: CallRequest) -> Result<CallReceipt, EnvError>;

    /// Returns the balance of an account.
    async fn balance(&self, account: &AccountAddress) -> Result<BigInt, EnvError>;

    /// Returns the addressable contract set, in deployment order.
    fn contracts(&self) -> Vec<ContractHandle>;
}

/// Reads the structured field values of one contract kind.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// The contract kind this provider understands.
    fn kind(&self) -> &str;

    /// Captures every observable field of `contract`.
    ///
    /// # Arguments
    /// * `contract` - The deployed contract to read
    /// * `actors` - Accounts whose per-user data should be included
    async fn snapshot(
        &self,
        contract: &ContractHandle,
        actors: &[AccountAddress],
    ) -> Result<BTreeMap<String, Value>, EnvError>;
}

/// Deploys the contracts under test.
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Executes every step of `descriptor` in order and returns the
    /// deployed, addressable contract set.
    async fn deploy(&self, descriptor: &DeploymentDescriptor) -> Result<Vec<ContractHandle>, EnvError>;
}

/// Fault injection for simulated environments.
pub trait EnvironmentController: Send + Sync {
    /// Makes the environment unreachable after `calls` more calls.
    fn fail_after(&self, calls: u64);

    /// Makes the environment unreachable (or reachable again) immediately.
    fn set_unreachable(&self, unreachable: bool);

    /// Restores normal operation.
    fn heal(&self);
}
