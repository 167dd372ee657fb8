//! Simulation run loop.
//!
//! ```text
//! Initializing ──▶ Running ──┬──▶ Completed        (budget reached / no eligible action)
//!                            ├──▶ ViolationHalted  (stop-on-violation)
//!                            ├──▶ Aborted          (infrastructure fault / timeout / cancel)
//!                            └──▶ Rejected         (parameter rule cannot be evaluated)
//! ```
//!
//! Each step runs select → execute → snapshot → validate → record, strictly
//! in order. The next step's selection always sees the previous step's
//! post-snapshot.

use crate::context::{stream_rng, SCHEDULER_STREAM};
use crate::executor::ActionExecutor;
use crate::record::{RunRecord, RunStatus, StepLog, StepRecord};
use crate::scheduler::{ScheduleDecision, Scheduler};
use crate::world::SimWorld;

use protosim_core::{capture_state, ExecutionOutcome, RuleTally, SnapshotId, WorldState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// External stop signal, honored between steps only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one initialized world to a terminal state.
pub struct SimulationRunner {
    world: SimWorld,
    scheduler: Scheduler,
    executor: ActionExecutor,
    record: RunRecord,
    log: Option<StepLog>,
    cancel: CancelToken,
}

impl SimulationRunner {
    /// Creates a runner; the scheduler stream is derived from the run seed.
    pub fn new(world: SimWorld) -> Self {
        let config = &world.config;
        let scheduler = Scheduler::new(stream_rng(config.seed, SCHEDULER_STREAM))
            .with_weighting(config.weighting)
            .with_max_attempts(config.max_attempts);
        let executor = ActionExecutor::new(Arc::clone(&world.env.execution));
        let record = RunRecord::new(&config.simulation_id, config.seed);

        Self {
            world,
            scheduler,
            executor,
            record,
            log: None,
            cancel: CancelToken::new(),
        }
    }

    /// Streams every completed step to a JSON-lines log.
    pub fn with_step_log(mut self, log: StepLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Tags the record with a scenario name.
    pub fn with_scenario(mut self, scenario: &str) -> Self {
        self.record = self.record.with_scenario(scenario);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops this run before its next step.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs to completion and returns the run record.
    pub async fn run(self) -> RunRecord {
        let Self {
            mut world,
            mut scheduler,
            executor,
            mut record,
            mut log,
            cancel,
        } = self;

        let config = world.config.clone();
        let accounts = world.registry.all_accounts();
        let started = world.context.now();
        info!(
            "Starting run {} (seed={}, budget={})",
            config.simulation_id, config.seed, config.step_budget
        );

        let mut current: WorldState = match world.snapshots.latest() {
            Some(snapshot) => snapshot.state.clone(),
            None => {
                record.finish(
                    RunStatus::Aborted,
                    Some("no initial snapshot".to_string()),
                    Vec::new(),
                );
                return record;
            }
        };
        let mut executed: u64 = 0;
        // Decision drawn after the previous step, against its post-state.
        let mut pending: Option<ScheduleDecision> = None;

        let (status, reason) = loop {
            if executed >= config.step_budget {
                break (RunStatus::Completed, Some(format!("step budget of {} reached", config.step_budget)));
            }
            if cancel.is_cancelled() {
                break (RunStatus::Aborted, Some(format!("cancelled after {} steps", executed)));
            }
            if let Some(timeout) = config.timeout {
                if world.context.now().saturating_sub(started) >= timeout {
                    break (RunStatus::Aborted, Some(format!("timed out after {:?}", timeout)));
                }
            }

            let index = executed + 1;

            if config.verify_serialization {
                match capture_state(world.env.execution.as_ref(), &world.env.providers, &accounts).await {
                    Ok(state) => {
                        let consistent = state == current;
                        world.snapshots.record(SnapshotId::diagnostic(index), state);
                        if !consistent {
                            break (
                                RunStatus::Aborted,
                                Some(format!("state changed between steps before step {}", index)),
                            );
                        }
                    }
                    Err(e) => break (RunStatus::Aborted, Some(format!("diagnostic capture failed: {}", e))),
                }
            }

            let decision = match pending.take() {
                Some(decision) => decision,
                None => scheduler.select_next(&world.registry, &world.catalogue, &current),
            };
            let selection = match decision {
                ScheduleDecision::Selected(selection) => selection,
                ScheduleDecision::NoEligibleAction => {
                    break (RunStatus::Completed, Some("no eligible action".to_string()));
                }
                ScheduleDecision::AuthoringError { action, message } => {
                    break (RunStatus::Rejected, authoring_reason(&action, &message, index));
                }
            };
            let (Some(actor), Some(model)) = (
                world.registry.get(selection.actor_index),
                world.catalogue.get(&selection.action),
            ) else {
                break (RunStatus::Aborted, Some(format!("scheduler chose an unknown pair at step {}", index)));
            };
            let sender = actor.primary_account();

            let outcome = executor.execute(model, &selection.params, sender).await;
            if let ExecutionOutcome::InfrastructureError { message } = &outcome {
                break (
                    RunStatus::Aborted,
                    Some(format!("infrastructure fault at step {}: {}", index, message)),
                );
            }

            let post = match capture_state(world.env.execution.as_ref(), &world.env.providers, &accounts).await {
                Ok(state) => state,
                Err(e) => {
                    break (
                        RunStatus::Aborted,
                        Some(format!("snapshot capture failed after step {}: {}", index, e)),
                    );
                }
            };
            world.context.sleep(config.step_interval).await;

            let results = world
                .validator
                .evaluate(model, &current, &post, &selection.params, &outcome, sender);
            let tally = RuleTally::from_results(&results);
            debug!(
                "Step {}: {} {}{} -> {} ({} violated)",
                index,
                actor.id,
                model.name,
                selection.params,
                outcome.label(),
                tally.violated
            );

            world.snapshots.record(SnapshotId::pre(index), current.clone());
            world.snapshots.record(SnapshotId::post(index), post.clone());
            let step = StepRecord {
                step: index,
                actor: actor.id.clone(),
                account: sender.clone(),
                action: model.name.clone(),
                params: selection.params,
                pre_snapshot: SnapshotId::pre(index),
                post_snapshot: SnapshotId::post(index),
                outcome,
                results,
                tally,
                time_ms: world.context.now().as_millis() as u64,
            };
            if let Some(log) = log.as_mut() {
                if let Err(e) = log.append(&step) {
                    warn!("Failed to append to step log: {}", e);
                }
            }
            record.push_step(step);
            current = post;
            executed = index;

            if executed >= config.step_budget {
                break (RunStatus::Completed, Some(format!("step budget of {} reached", config.step_budget)));
            }
            let next = scheduler.select_next(&world.registry, &world.catalogue, &current);
            match &next {
                ScheduleDecision::NoEligibleAction => {
                    break (RunStatus::Completed, Some("no eligible action".to_string()));
                }
                ScheduleDecision::AuthoringError { action, message } => {
                    break (RunStatus::Rejected, authoring_reason(action, message, index + 1));
                }
                ScheduleDecision::Selected(_) => {}
            }
            if config.stop_on_violation && tally.violated > 0 {
                break (RunStatus::ViolationHalted, Some(format!("violation at step {}", index)));
            }
            pending = Some(next);
        };

        match status {
            RunStatus::Aborted => error!("Run {} aborted: {}", config.simulation_id, reason.as_deref().unwrap_or("")),
            RunStatus::ViolationHalted => warn!("Run {} halted on violation", config.simulation_id),
            RunStatus::Rejected => error!("Run {} rejected: {}", config.simulation_id, reason.as_deref().unwrap_or("")),
            _ => info!(
                "Run {} completed: {} steps, {} violations",
                config.simulation_id,
                executed,
                record.violations()
            ),
        }

        record.summary.final_time_ms = world.context.now().as_millis() as u64;
        record.finish(status, reason, world.snapshots.into_snapshots());
        record
    }
}

fn authoring_reason(action: &str, message: &str, step: u64) -> Option<String> {
    Some(format!("authoring error in '{}' before step {}: {}", action, step, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Defects, LendingConfig, SimChain};
    use crate::context::SimContext;
    use crate::scenarios::{ScenarioId, LENDING_ACTIONS};
    use crate::world::{Environment, RunConfig, RunInputs};
    use protosim_core::{RuleKind, SnapshotPhase};
    use protosim_env::{EnvironmentController, TokioContext};
    use proptest::prelude::*;
    use std::time::Duration;

    fn config(seed: u64, steps: u64) -> RunConfig {
        RunConfig::new(seed)
            .with_simulation_id(format!("test-{}", seed))
            .with_step_budget(steps)
            .with_ignored(["StableBaseCDP.redemptionQueue"])
    }

    async fn world_on(chain: Arc<SimChain>, config: RunConfig) -> SimWorld {
        let context = SimContext::shared(config.seed);
        SimWorld::initialize(config, &ScenarioId::Lending.inputs(), Environment::in_memory(chain), context)
            .await
            .unwrap()
    }

    async fn run(config: RunConfig, lending: LendingConfig) -> RunRecord {
        let world = world_on(SimChain::shared(lending), config).await;
        SimulationRunner::new(world).run().await
    }

    #[tokio::test]
    async fn test_budget_termination() {
        let record = run(config(3, 25), LendingConfig::default()).await;
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.steps.len(), 25);
        assert_eq!(record.summary.steps_executed, 25);
        let indices: Vec<u64> = record.steps.iter().map(|s| s.step).collect();
        assert_eq!(indices, (1..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_zero_budget_executes_nothing() {
        let record = run(config(3, 0), LendingConfig::default()).await;
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.steps.is_empty());
        assert_eq!(record.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_protocol_has_no_violations() {
        for seed in [1, 2, 3] {
            let record = run(config(seed, 60), LendingConfig::default()).await;
            assert_eq!(record.status, RunStatus::Completed);
            assert_eq!(record.violations(), 0, "seed {}: {:?}", seed, record.summary.violated_rules);
            assert_eq!(record.summary.tally.authoring_errors, 0);
            assert_eq!(record.exit_code(), 0);
        }
    }

    #[tokio::test]
    async fn test_snapshots_pair_up() {
        let record = run(config(5, 10), LendingConfig::default()).await;
        let phases: Vec<SnapshotPhase> = record.snapshots.iter().map(|s| s.id.phase).collect();
        assert_eq!(phases[0], SnapshotPhase::Initial);
        assert_eq!(phases.iter().filter(|p| **p == SnapshotPhase::Pre).count(), 10);
        assert_eq!(phases.iter().filter(|p| **p == SnapshotPhase::Post).count(), 10);

        // post of step i equals pre of step i+1
        for i in 1..10u64 {
            let post = record.snapshots.iter().find(|s| s.id == SnapshotId::post(i)).unwrap();
            let pre = record.snapshots.iter().find(|s| s.id == SnapshotId::pre(i + 1)).unwrap();
            assert_eq!(post.state, pre.state);
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_record() {
        let a = run(config(11, 30), LendingConfig::default()).await;
        let b = run(config(11, 30), LendingConfig::default()).await;
        assert_eq!(a, b);

        let c = run(config(12, 30), LendingConfig::default()).await;
        assert_ne!(a.steps, c.steps);
    }

    #[tokio::test]
    async fn test_faulty_debt_detected_and_halts() {
        let lending = LendingConfig {
            defects: Defects { skip_total_debt: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let record = run(config(4, 200).with_stop_on_violation(true), lending).await;
        assert_eq!(record.status, RunStatus::ViolationHalted);
        assert_eq!(record.exit_code(), 2);

        let last = record.steps.last().unwrap();
        assert!(last.violations() > 0);
        assert!(record.steps[..record.steps.len() - 1].iter().all(|s| s.violations() == 0));
    }

    #[tokio::test]
    async fn test_budget_reported_before_violation_halt() {
        let lending = LendingConfig {
            defects: Defects { skip_total_debt: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let full = run(config(4, 200).with_stop_on_violation(true), lending.clone()).await;
        let halted_at = full.steps.len() as u64;

        // same seed, budget ending exactly on the violating step
        let record = run(config(4, halted_at).with_stop_on_violation(true), lending).await;
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.violations() > 0);
        assert_eq!(record.exit_code(), 1);
    }

    /// Lending inputs reduced to one actor whose single action spends the
    /// whole starting balance.
    fn single_open_inputs(extra_rule: &str, max: &str) -> RunInputs {
        let mut inputs = ScenarioId::Lending.inputs();
        let mut catalogue: serde_json::Value = serde_json::from_str(LENDING_ACTIONS).unwrap();
        let actions = catalogue["actions"].as_array_mut().unwrap();
        actions.retain(|a| a["name"] == "openSafe");
        let open = &mut actions[0];
        open["pre_execution_parameter_generation_rules"][0]["rule"]["min"] = 1000.into();
        open["pre_execution_parameter_generation_rules"][0]["rule"]["max"] = max.into();
        open["post_execution_contract_state_validation_rules"][0]["rules"]
            .as_array_mut()
            .unwrap()
            .push(extra_rule.into());
        inputs.actions = catalogue.to_string();
        inputs.actors = r#"{"actors": [{"name": "Opener", "actions": [{"name": "openSafe", "probability": 1.0}]}]}"#.into();
        inputs
    }

    async fn run_inputs(config: RunConfig, inputs: &RunInputs) -> RunRecord {
        let context = SimContext::shared(config.seed);
        let env = Environment::in_memory(SimChain::shared(LendingConfig::default()));
        let world = SimWorld::initialize(config, inputs, env, context).await.unwrap();
        SimulationRunner::new(world).run().await
    }

    #[tokio::test]
    async fn test_no_eligible_action_reported_before_violation_halt() {
        let inputs = single_open_inputs("1 == 2", "pre.accounts[actor].balance");
        let record = run_inputs(config(5, 10).with_stop_on_violation(true), &inputs).await;
        assert_eq!(record.steps.len(), 1);
        assert!(record.violations() > 0);
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.reason.as_deref(), Some("no eligible action"));
        assert_eq!(record.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_parameter_authoring_error_rejects_run() {
        let inputs = single_open_inputs("1 == 1", "pre.accounts[actor].balance / (1000 - pre.accounts[actor].balance)");
        let record = run_inputs(config(5, 10), &inputs).await;
        assert_eq!(record.status, RunStatus::Rejected);
        assert!(record.steps.is_empty());
        let reason = record.reason.as_deref().unwrap();
        assert!(reason.contains("openSafe") && reason.contains("step 1"), "{}", reason);
        assert_eq!(record.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_unordered_queue_flagged_by_invariant() {
        let lending = LendingConfig {
            defects: Defects { unordered_queue: true, ..Defects::default() },
            ..LendingConfig::default()
        };
        let record = run(config(8, 150), lending).await;
        let queue_violations = record
            .steps
            .iter()
            .flat_map(|s| s.results.iter())
            .filter(|r| r.kind == RuleKind::Queue && r.is_violation())
            .count();
        assert!(queue_violations > 0);
    }

    #[tokio::test]
    async fn test_infrastructure_fault_aborts() {
        let chain = SimChain::shared(LendingConfig::default());
        let world = world_on(chain.clone(), config(6, 50)).await;
        chain.fail_after(5);

        let record = SimulationRunner::new(world).run().await;
        assert_eq!(record.status, RunStatus::Aborted);
        assert_eq!(record.steps.len(), 5);
        assert!(record.reason.unwrap().contains("step 6"));
        assert!(record.snapshots.iter().any(|s| s.id == SnapshotId::pre(5)));
        assert!(record.snapshots.iter().all(|s| s.id.step <= 5));
    }

    #[tokio::test]
    async fn test_timeout_preserves_partial_record() {
        // each step advances the virtual clock by 12s
        let record = run(config(2, 50).with_timeout(Duration::from_secs(60)), LendingConfig::default()).await;
        assert_eq!(record.status, RunStatus::Aborted);
        assert_eq!(record.steps.len(), 5);
        assert_eq!(record.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_timeout_follows_wall_clock_context() {
        let config = config(2, 50)
            .with_step_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_millis(50));
        let env = Environment::in_memory(SimChain::shared(LendingConfig::default()));
        let world = SimWorld::initialize(config, &ScenarioId::Lending.inputs(), env, TokioContext::shared())
            .await
            .unwrap();
        let record = SimulationRunner::new(world).run().await;
        assert_eq!(record.status, RunStatus::Aborted);
        assert!(!record.steps.is_empty() && record.steps.len() < 50);
        assert!(record.reason.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let world = world_on(SimChain::shared(LendingConfig::default()), config(2, 50)).await;
        let token = CancelToken::new();
        let runner = SimulationRunner::new(world).with_cancel_token(token.clone());
        assert!(!runner.cancel_token().is_cancelled());
        token.cancel();
        let record = runner.run().await;
        assert_eq!(record.status, RunStatus::Aborted);
        assert!(record.steps.is_empty());
    }

    #[tokio::test]
    async fn test_serialization_check_passes_on_clean_chain() {
        let record = run(config(9, 10).with_serialization_check(true), LendingConfig::default()).await;
        assert_eq!(record.status, RunStatus::Completed);
        let diagnostics = record
            .snapshots
            .iter()
            .filter(|s| s.id.phase == SnapshotPhase::Diagnostic)
            .count();
        assert_eq!(diagnostics, 10);
    }

    #[tokio::test]
    async fn test_no_eligible_action_completes() {
        let mut inputs = ScenarioId::Lending.inputs();
        inputs.actors = r#"{"actors": [{"name": "Repayer", "actions": [{"name": "repay", "probability": 1.0}]}]}"#.into();
        let context = SimContext::shared(1);
        let world = SimWorld::initialize(
            config(1, 10),
            &inputs,
            Environment::in_memory(SimChain::shared(LendingConfig::default())),
            context,
        )
        .await
        .unwrap();
        let record = SimulationRunner::new(world).run().await;
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.steps.is_empty());
        assert_eq!(record.reason.as_deref(), Some("no eligible action"));
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn test_determinism_any_seed(seed in any::<u64>()) {
            let a = block_on(run(config(seed, 15), LendingConfig::default()));
            let b = block_on(run(config(seed, 15), LendingConfig::default()));
            prop_assert_eq!(a, b);
        }
    }
}
