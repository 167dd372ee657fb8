//! Core clock/entropy context trait for protosim runs.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// The central interface for time and seed access.
///
/// This trait abstracts the "real world" so that the run loop behaves the
/// same against a live deployment and inside a deterministic simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - virtual clock, seeded entropy
#[async_trait]
pub trait SimulationContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Used for run timeouts. In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time for record timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
