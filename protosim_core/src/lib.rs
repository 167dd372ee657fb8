//! protosim Core - Action-Model-Driven Differential Testing
//!
//! This crate holds everything that decides whether an executed protocol
//! action behaved as declared:
//!
//! - **Rule expressions**: a closed AST ([`expr`]), parsed once at load time
//!   ([`parser`]) and evaluated over arbitrary-precision state ([`eval`])
//! - **Action models**: parameter generation, conditional state updates and
//!   post-execution rules ([`action_model`], [`params`])
//! - **Snapshots**: immutable step-addressed world state captures and diffs
//!   ([`snapshot`])
//! - **Validation**: expected-vs-observed updates, the closed-world check,
//!   protocol invariants and linked-queue checks ([`validation`],
//!   [`invariants`], [`queue`])
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   parse    ┌─────────────┐
//! │ action model   │──────────▶ │ ActionModel │──── generate_parameters ───▶ Parameters
//! │ document (JSON)│            └──────┬──────┘
//! └────────────────┘                   │ updates / rules
//!                                      ▼
//!  pre Snapshot ─┐             ┌──────────────┐
//!  post Snapshot ├───────────▶ │  Validator   │───▶ Vec<RuleResult>
//!  outcome ──────┘             └──────────────┘
//! ```

pub mod action_model;
pub mod error;
pub mod eval;
pub mod expr;
pub mod invariants;
pub mod outcome;
pub mod params;
pub mod parser;
pub mod path;
pub mod queue;
pub mod snapshot;
pub mod validation;

pub use action_model::{ActionCatalogue, ActionModel, Effect, StateUpdate, ValidationRule};
pub use error::CoreError;
pub use eval::Bindings;
pub use expr::Expr;
pub use invariants::ProtocolInvariants;
pub use outcome::ExecutionOutcome;
pub use params::{ParameterDraw, Parameters};
pub use path::{FieldPath, StatePath};
pub use snapshot::{
    capture_state, ProviderSet, Snapshot, SnapshotId, SnapshotPhase, SnapshotStore, WorldState,
};
pub use validation::{RuleKind, RuleResult, RuleStatus, RuleTally, Validator};
