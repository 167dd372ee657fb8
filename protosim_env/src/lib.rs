//! protosim Environment Abstraction Layer
//!
//! This crate provides the seams through which the simulation core talks to
//! the outside world, so the same run loop can drive either a **live**
//! contract deployment or a deterministic **in-memory** one.
//!
//! # Seams
//!
//! - Execution: `ExecutionEnvironment::execute()` returns a receipt
//!   (success or revert) or an infrastructure fault
//! - Observation: one `SnapshotProvider` per contract kind, plus
//!   `ExecutionEnvironment::balance()` per actor account
//! - Setup: `DeploymentService::deploy()` consumes a `DeploymentDescriptor`
//! - Time: `SimulationContext::now()` / `sleep()`
//!
//! # Example
//!
//! ```ignore
//! use protosim_env::{CallRequest, ExecutionEnvironment};
//!
//! async fn poke<E: ExecutionEnvironment>(env: &E, request: CallRequest) {
//!     match env.execute(request).await {
//!         Ok(receipt) => println!("{:?}", receipt.status),
//!         Err(fault) => eprintln!("infrastructure fault: {}", fault),
//!     }
//! }
//! ```

mod context;
mod deployment;
mod environment;
mod error;
mod tokio_impl;
mod types;

pub use context::SimulationContext;
pub use deployment::{resolve_params, DeploymentDescriptor, DeploymentParam, DeploymentStep, ParamSource};
pub use environment::{DeploymentService, EnvironmentController, ExecutionEnvironment, SnapshotProvider};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::{AccountAddress, CallReceipt, CallRequest, CallStatus, ContractHandle, Value};
