//! protosim CLI
//!
//! Run action-model-driven simulations against a deployed protocol.

use clap::Parser;
use protosim_sim::scenarios::ScenarioId;
use protosim_sim::{
    ActorWeighting, Environment, InitError, RunConfig, RunInputs, RunRecord, RunStatus, SimContext, SimWorld,
    SimulationRunner, StepLog, MEMORY_CONNECTION,
};
use protosim_env::{SimulationContext, TokioContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// protosim differential testing CLI
#[derive(Parser, Debug)]
#[command(name = "protosim")]
#[command(about = "Run action-model-driven simulations of a deployed protocol", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// This worker's shard of the seed range
    #[arg(long, default_value = "0")]
    worker_index: u64,

    /// Number of workers sharing the seed range
    #[arg(long, default_value = "1")]
    worker_count: u64,

    /// Step budget per run
    #[arg(short = 'n', long, default_value = "50")]
    steps: u64,

    /// Abort a run after this many seconds of virtual step time, or of
    /// real time with --wall-clock
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Measure time with the real clock instead of the virtual step clock
    #[arg(long)]
    wall_clock: bool,

    /// Halt a run at its first violating step
    #[arg(long)]
    stop_on_violation: bool,

    /// Scenario to run (lending, lending_faulty_debt, lending_frozen_mode,
    /// lending_unordered_queue, lending_outage, all)
    #[arg(short = 'S', long, default_value = "lending")]
    scenario: String,

    /// Action model catalogue (JSON); replaces the scenario's
    #[arg(long)]
    actions: Option<PathBuf>,

    /// Actor roster (JSON); replaces the scenario's
    #[arg(long)]
    actors: Option<PathBuf>,

    /// Deployment descriptor (JSON); replaces the scenario's
    #[arg(long)]
    deployment: Option<PathBuf>,

    /// Protocol invariants (JSON); replaces the scenario's
    #[arg(long)]
    invariants: Option<PathBuf>,

    /// Execution environment connection
    #[arg(long, default_value = MEMORY_CONNECTION)]
    connection: String,

    /// Write the run record to this file (seed and scenario are appended
    /// when more than one run is made)
    #[arg(long)]
    record: Option<String>,

    /// Stream completed steps to this JSON-lines file
    #[arg(long)]
    log: Option<String>,

    /// Extra field prefixes exempt from the closed-world check
    #[arg(long)]
    ignore: Vec<String>,

    /// Recapture state before each step and abort on drift
    #[arg(long)]
    verify_serialization: bool,

    /// Actions tried per actor before it is skipped for a step
    #[arg(long, default_value = "3")]
    max_attempts: usize,

    /// Draw actors proportionally to their roster weight
    #[arg(long)]
    weighted_actors: bool,

    /// Simulation identifier (random when omitted)
    #[arg(long)]
    simulation_id: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

/// Output file for one run; suffixed when a batch writes several.
fn output_path(base: &str, seed: u64, scenario: ScenarioId, batch: bool) -> String {
    if batch {
        format!("{}.{}.{}", base, scenario.name(), seed)
    } else {
        base.to_string()
    }
}

/// Replaces scenario documents with the files given on the command line.
fn load_inputs(args: &Args, scenario: ScenarioId) -> Result<RunInputs, InitError> {
    let mut inputs = scenario.inputs();
    if let Some(path) = &args.actions {
        inputs.actions = RunInputs::read(path)?;
    }
    if let Some(path) = &args.actors {
        inputs.actors = RunInputs::read(path)?;
    }
    if let Some(path) = &args.deployment {
        inputs.deployment = RunInputs::read(path)?;
    }
    if let Some(path) = &args.invariants {
        inputs.invariants = Some(RunInputs::read(path)?);
    }
    Ok(inputs)
}

async fn run_one(args: &Args, scenario: ScenarioId, seed: u64, batch: bool) -> RunRecord {
    let mut config = RunConfig::new(seed)
        .with_step_budget(args.steps)
        .with_stop_on_violation(args.stop_on_violation)
        .with_max_attempts(args.max_attempts)
        .with_serialization_check(args.verify_serialization)
        .with_ignored(scenario.ignored().iter().copied())
        .with_ignored(args.ignore.iter().cloned());
    if let Some(id) = &args.simulation_id {
        let id = if batch { format!("{}-{}-{}", id, scenario.name(), seed) } else { id.clone() };
        config = config.with_simulation_id(id);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if args.weighted_actors {
        config = config.with_weighting(ActorWeighting::Weighted);
    }
    let context: Arc<dyn SimulationContext> = if args.wall_clock {
        config = config.with_step_interval(Duration::ZERO);
        TokioContext::shared()
    } else {
        SimContext::shared(seed)
    };
    let simulation_id = config.simulation_id.clone();

    let initialized = async {
        let inputs = load_inputs(args, scenario)?;
        let env = Environment::connect(&args.connection, scenario.lending_config())?;
        if let (Some(calls), Some(controller)) = (scenario.fail_after(), &env.controller) {
            controller.fail_after(calls);
        }
        SimWorld::initialize(config, &inputs, env, context).await
    }
    .await;

    let world = match initialized {
        Ok(world) => world,
        Err(e) => {
            let status = if e.is_authoring() { RunStatus::Rejected } else { RunStatus::Aborted };
            error!("{} (seed={}) failed to initialize: {}", scenario.name(), seed, e);
            return RunRecord::failed_init(&simulation_id, seed, status, e.to_string()).with_scenario(scenario.name());
        }
    };

    let mut runner = SimulationRunner::new(world).with_scenario(scenario.name());
    if let Some(base) = &args.log {
        let path = output_path(base, seed, scenario, batch);
        match StepLog::create(&path) {
            Ok(log) => runner = runner.with_step_log(log),
            Err(e) => warn!("Failed to create step log {}: {}", path, e),
        }
    }
    let record = runner.run().await;

    if let Some(base) = &args.record {
        let path = output_path(base, seed, scenario, batch);
        match record.write_to_file(&path) {
            Ok(()) => info!("Wrote run record to {}", path),
            Err(e) => error!("Failed to write run record: {:?}", e),
        }
    }
    record
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if !args.json {
        info!("protosim v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(4);
        })]
    };

    if args.worker_count == 0 || args.worker_index >= args.worker_count {
        eprintln!(
            "Error: worker index {} is outside 0..{}",
            args.worker_index, args.worker_count
        );
        std::process::exit(4);
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let seeds: Vec<u64> = (0..args.seeds)
        .filter(|offset| offset % args.worker_count == args.worker_index)
        .map(|offset| base_seed.wrapping_add(offset))
        .collect();
    let batch = seeds.len() * scenarios.len() > 1;

    let mut records: Vec<RunRecord> = Vec::new();
    for &seed in &seeds {
        for &scenario in &scenarios {
            let record = run_one(&args, scenario, seed, batch).await;
            if !args.json {
                match record.exit_code() {
                    0 => info!(
                        "✓ {} (seed={}) {} steps, no violations",
                        scenario.name(),
                        seed,
                        record.summary.steps_executed
                    ),
                    _ => warn!(
                        "✗ {} (seed={}) {}: {} violations{}",
                        scenario.name(),
                        seed,
                        record.status,
                        record.violations(),
                        record.reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default()
                    ),
                }
            }
            records.push(record);
        }
    }

    let exit_code = records.iter().map(RunRecord::exit_code).max().unwrap_or(0);

    if args.json {
        let summary = serde_json::json!({
            "total": records.len(),
            "clean": records.iter().filter(|r| r.exit_code() == 0).count(),
            "exit_code": exit_code,
            "results": records.iter().map(|r| {
                serde_json::json!({
                    "simulation_id": r.simulation_id,
                    "scenario": r.scenario,
                    "seed": r.seed,
                    "status": r.status.name(),
                    "expected_status": r
                        .scenario
                        .as_deref()
                        .and_then(|name| name.parse::<ScenarioId>().ok())
                        .map(|scenario| scenario.expected_status().name()),
                    "reason": r.reason,
                    "steps": r.summary.steps_executed,
                    "reverts": r.summary.reverts,
                    "violations": r.violations(),
                    "authoring_errors": r.summary.tally.authoring_errors,
                    "violated_rules": r.summary.violated_rules,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        let failed = records.iter().filter(|r| r.exit_code() != 0).count();
        if failed == 0 {
            info!("✅ All {} runs clean", records.len());
        } else {
            error!("❌ {}/{} runs not clean", failed, records.len());
            for record in records.iter().filter(|r| r.exit_code() != 0) {
                for rule in &record.summary.violated_rules {
                    error!("  - seed={} {}", record.seed, rule);
                }
            }
        }
    }

    std::process::exit(exit_code);
}
