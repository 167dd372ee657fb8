//! protosim Simulation Harness
//!
//! Runs a deployed multi-contract protocol under a seeded sequence of actor
//! actions and checks every step against the action models in
//! `protosim_core`.
//!
//! # Core Principle: One Seed, One Run
//!
//! All sources of non-determinism are controlled:
//! - **Time**: [`SimContext`] is a virtual clock advanced once per step
//! - **Randomness**: scheduling and account derivation draw from separate
//!   ChaCha8 streams of a single 64-bit seed
//! - **Environment**: the in-memory [`SimChain`] executes calls
//!   deterministically and can be told to fail
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SimulationRunner                        │
//! │  ┌───────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │ Scheduler │──▶│ActionExecutor│──▶│ ExecutionEnvironment│ │
//! │  └─────▲─────┘   └──────────────┘   └─────────┬──────────┘  │
//! │        │ pre state                      capture│             │
//! │  ┌─────┴──────────────────────────────────────▼─────────┐   │
//! │  │ SnapshotStore ──▶ Validator ──▶ RunRecord / StepLog  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use protosim_sim::{Environment, RunConfig, SimContext, SimWorld, SimulationRunner};
//! use protosim_sim::scenarios::ScenarioId;
//!
//! let scenario = ScenarioId::Lending;
//! let config = RunConfig::new(42).with_step_budget(100).with_ignored(scenario.ignored().iter().copied());
//! let env = Environment::connect("memory://lending", scenario.lending_config())?;
//! let world = SimWorld::initialize(config, &scenario.inputs(), env, SimContext::shared(42)).await?;
//! let record = SimulationRunner::new(world).run().await;
//! ```

pub mod accounts;
pub mod actor;
pub mod chain;
mod context;
pub mod executor;
pub mod record;
pub mod runner;
pub mod scenarios;
pub mod scheduler;
pub mod world;

pub use accounts::DeterministicAccountProvider;
pub use actor::{Actor, ActorRegistry, ActorRoster};
pub use chain::{Defects, LendingConfig, SimChain};
pub use context::{stream_rng, SimContext, ACCOUNT_STREAM, SCHEDULER_STREAM};
pub use executor::ActionExecutor;
pub use record::{RunRecord, RunStatus, StepLog, StepRecord};
pub use runner::{CancelToken, SimulationRunner};
pub use scheduler::{ActorWeighting, ScheduleDecision, Scheduler};
pub use world::{Environment, InitError, RunConfig, RunInputs, SimWorld, MEMORY_CONNECTION};
