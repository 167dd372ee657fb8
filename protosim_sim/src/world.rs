//! SimWorld - everything a run needs, assembled during `Initializing`.

use crate::accounts::DeterministicAccountProvider;
use crate::actor::{ActorRegistry, ActorRoster};
use crate::chain::{LendingConfig, SimChain};
use crate::context::ACCOUNT_STREAM;
use crate::scheduler::ActorWeighting;

use protosim_core::{ActionCatalogue, CoreError, ProtocolInvariants, ProviderSet, SnapshotId, SnapshotStore, Validator};
use protosim_env::{
    ContractHandle, DeploymentDescriptor, DeploymentService, EnvError, EnvironmentController, ExecutionEnvironment,
    SimulationContext,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Connection string of the built-in in-memory lending deployment.
pub const MEMORY_CONNECTION: &str = "memory://lending";

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Identifier carried into the run record
    pub simulation_id: String,

    /// Master seed for determinism
    pub seed: u64,

    /// Maximum number of executed steps
    pub step_budget: u64,

    /// Abort once this much time has elapsed on the run's context: step
    /// time on [`SimContext`](crate::SimContext), real time on
    /// `TokioContext`
    pub timeout: Option<Duration>,

    /// Halt as soon as a step records a violation
    pub stop_on_violation: bool,

    /// Actions tried per actor before it is skipped for a step
    pub max_attempts: usize,

    /// How the acting actor is drawn
    pub weighting: ActorWeighting,

    /// Recapture the pre-state before every step and compare it with the
    /// previous post-state
    pub verify_serialization: bool,

    /// Field prefixes exempt from the closed-world check
    pub closed_world_ignore: Vec<String>,

    /// Context time that passes per step
    pub step_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            simulation_id: Uuid::new_v4().to_string(),
            seed: 42,
            step_budget: 50,
            timeout: None,
            stop_on_violation: false,
            max_attempts: 3,
            weighting: ActorWeighting::Uniform,
            verify_serialization: false,
            closed_world_ignore: Vec::new(),
            step_interval: Duration::from_secs(12),
        }
    }
}

impl RunConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub fn with_simulation_id(mut self, id: impl Into<String>) -> Self {
        self.simulation_id = id.into();
        self
    }

    pub fn with_step_budget(mut self, steps: u64) -> Self {
        self.step_budget = steps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stop_on_violation(mut self, stop: bool) -> Self {
        self.stop_on_violation = stop;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_weighting(mut self, weighting: ActorWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_serialization_check(mut self, verify: bool) -> Self {
        self.verify_serialization = verify;
        self
    }

    pub fn with_ignored<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.closed_world_ignore.extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }
}

/// Failures during `Initializing`.
#[derive(Debug, Error)]
pub enum InitError {
    /// A document describing the protocol is defective
    #[error("Authoring error: {0}")]
    Authoring(#[from] CoreError),

    /// Deployment or the first snapshot failed
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] EnvError),

    /// An input document could not be read
    #[error("Failed to read {path}: {message}")]
    Input { path: String, message: String },
}

impl InitError {
    /// Authoring errors reject the run; everything else aborts it.
    pub fn is_authoring(&self) -> bool {
        match self {
            InitError::Authoring(e) => e.is_authoring(),
            _ => false,
        }
    }
}

/// The JSON documents describing one protocol.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub actions: String,
    pub actors: String,
    pub deployment: String,
    pub invariants: Option<String>,
}

impl RunInputs {
    /// Reads one input document from disk.
    pub fn read(path: &Path) -> Result<String, InitError> {
        std::fs::read_to_string(path).map_err(|e| InitError::Input {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// The seams a run talks through.
#[derive(Clone)]
pub struct Environment {
    pub execution: Arc<dyn ExecutionEnvironment>,
    pub deployer: Arc<dyn DeploymentService>,
    pub providers: ProviderSet,
    /// Present only for simulated environments
    pub controller: Option<Arc<dyn EnvironmentController>>,
}

impl Environment {
    /// Wraps an in-memory chain as every seam at once.
    pub fn in_memory(chain: Arc<SimChain>) -> Self {
        Self {
            providers: chain.providers(),
            execution: chain.clone(),
            deployer: chain.clone(),
            controller: Some(chain),
        }
    }

    /// Connects to the environment named by `connection`.
    ///
    /// Only the in-memory lending deployment is built in; anything else is
    /// reported as unreachable.
    pub fn connect(connection: &str, config: LendingConfig) -> Result<Self, InitError> {
        match connection {
            MEMORY_CONNECTION | "memory" => Ok(Self::in_memory(SimChain::shared(config))),
            other => Err(InitError::Infrastructure(EnvError::unreachable(format!(
                "unsupported connection '{}'",
                other
            )))),
        }
    }
}

/// The SimWorld - container for one initialized run.
pub struct SimWorld {
    /// Configuration
    pub config: RunConfig,

    /// Clock the run measures time against
    pub context: Arc<dyn SimulationContext>,

    /// Execution, deployment and snapshot seams
    pub env: Environment,

    /// Read-only action models
    pub catalogue: ActionCatalogue,

    /// Actors and their accounts
    pub registry: ActorRegistry,

    /// Rule checker, including protocol invariants
    pub validator: Validator,

    /// Deployed contracts
    pub contracts: Vec<ContractHandle>,

    /// Snapshots captured so far; starts with the initial capture
    pub snapshots: SnapshotStore,
}

impl SimWorld {
    /// Loads every document, deploys the protocol and captures the initial
    /// snapshot. Authoring errors are reported before anything is deployed.
    pub async fn initialize(
        config: RunConfig,
        inputs: &RunInputs,
        env: Environment,
        context: Arc<dyn SimulationContext>,
    ) -> Result<Self, InitError> {
        let catalogue = ActionCatalogue::from_json(&inputs.actions)?;
        let roster = ActorRoster::from_json(&inputs.actors, &catalogue)?;
        let invariants = match &inputs.invariants {
            Some(json) => ProtocolInvariants::from_json(json)?,
            None => ProtocolInvariants::default(),
        };
        let descriptor = DeploymentDescriptor::from_json(&inputs.deployment)?;

        let deployed: Vec<&str> = descriptor
            .steps
            .iter()
            .filter_map(|s| match s {
                protosim_env::DeploymentStep::Contract { contract, .. } => Some(contract.as_str()),
                protosim_env::DeploymentStep::Transaction { .. } => None,
            })
            .collect();
        for model in catalogue.iter() {
            if !deployed.contains(&model.contract.as_str()) {
                return Err(InitError::Authoring(CoreError::malformed(
                    &model.name,
                    format!("contract '{}' is not part of the deployment", model.contract),
                )));
            }
        }

        let mut accounts = DeterministicAccountProvider::new(config.seed ^ ACCOUNT_STREAM);
        let registry = ActorRegistry::from_roster(&roster, &mut accounts);

        let contracts = env.deployer.deploy(&descriptor).await?;
        info!(
            "Deployed {} contracts, {} actors, {} actions",
            contracts.len(),
            registry.len(),
            catalogue.len()
        );

        let mut snapshots = SnapshotStore::new();
        snapshots
            .capture(
                env.execution.as_ref(),
                &env.providers,
                &registry.all_accounts(),
                SnapshotId::initial(),
            )
            .await?;

        let validator = Validator::new()
            .with_ignored(config.closed_world_ignore.iter())
            .with_invariants(invariants);

        Ok(Self {
            config,
            context,
            env,
            catalogue,
            registry,
            validator,
            contracts,
            snapshots,
        })
    }
}
