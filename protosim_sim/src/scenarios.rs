//! Built-in scenarios against the in-memory lending protocol.
//!
//! Every scenario runs the same action models; they differ in which defect
//! the simulated contracts carry and whether the environment fails.

use crate::chain::{Defects, LendingConfig};
use crate::record::RunStatus;
use crate::world::RunInputs;

pub const LENDING_ACTIONS: &str = include_str!("../fixtures/lending/actions.json");
pub const LENDING_ACTORS: &str = include_str!("../fixtures/lending/actors.json");
pub const LENDING_DEPLOYMENT: &str = include_str!("../fixtures/lending/deployment.json");
pub const LENDING_INVARIANTS: &str = include_str!("../fixtures/lending/invariants.json");

/// Fields checked by queue invariants instead of the closed-world check.
pub const LENDING_IGNORED: &[&str] = &["StableBaseCDP.redemptionQueue"];

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Correct contracts; any violation is a modelling bug
    Lending,

    /// `borrow` forgets to update total debt
    LendingFaultyDebt,

    /// The protocol never leaves bootstrap mode
    LendingFrozenMode,

    /// The redemption queue loses its weight order
    LendingUnorderedQueue,

    /// The chain becomes unreachable mid-run
    LendingOutage,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Lending,
            ScenarioId::LendingFaultyDebt,
            ScenarioId::LendingFrozenMode,
            ScenarioId::LendingUnorderedQueue,
            ScenarioId::LendingOutage,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Lending => "lending",
            ScenarioId::LendingFaultyDebt => "lending_faulty_debt",
            ScenarioId::LendingFrozenMode => "lending_frozen_mode",
            ScenarioId::LendingUnorderedQueue => "lending_unordered_queue",
            ScenarioId::LendingOutage => "lending_outage",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Lending => "CDP lending protocol with correct contracts, expects zero violations",
            ScenarioId::LendingFaultyDebt => "borrow skips the totalDebt update, expects a Debt violation",
            ScenarioId::LendingFrozenMode => "mode never switches to NORMAL, expects a mode update violation",
            ScenarioId::LendingUnorderedQueue => "redemption queue appends unsorted, expects a queue violation",
            ScenarioId::LendingOutage => "chain goes down after a few calls, expects an aborted run",
        }
    }

    /// The action models, actors, deployment and invariants.
    pub fn inputs(&self) -> RunInputs {
        RunInputs {
            actions: LENDING_ACTIONS.to_string(),
            actors: LENDING_ACTORS.to_string(),
            deployment: LENDING_DEPLOYMENT.to_string(),
            invariants: Some(LENDING_INVARIANTS.to_string()),
        }
    }

    /// Chain configuration with this scenario's defect switched on.
    pub fn lending_config(&self) -> LendingConfig {
        let defects = match self {
            ScenarioId::LendingFaultyDebt => Defects {
                skip_total_debt: true,
                ..Defects::default()
            },
            ScenarioId::LendingFrozenMode => Defects {
                frozen_mode: true,
                ..Defects::default()
            },
            ScenarioId::LendingUnorderedQueue => Defects {
                unordered_queue: true,
                ..Defects::default()
            },
            ScenarioId::Lending | ScenarioId::LendingOutage => Defects::default(),
        };
        LendingConfig {
            defects,
            ..LendingConfig::default()
        }
    }

    /// Successful calls before the chain goes down.
    pub fn fail_after(&self) -> Option<u64> {
        match self {
            ScenarioId::LendingOutage => Some(5),
            _ => None,
        }
    }

    pub fn ignored(&self) -> &'static [&'static str] {
        LENDING_IGNORED
    }

    /// Status a long enough run of this scenario should end in.
    pub fn expected_status(&self) -> RunStatus {
        match self {
            ScenarioId::Lending => RunStatus::Completed,
            ScenarioId::LendingOutage => RunStatus::Aborted,
            _ => RunStatus::ViolationHalted,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lending" | "clean" => Ok(ScenarioId::Lending),
            "lending_faulty_debt" | "faulty_debt" | "debt" => Ok(ScenarioId::LendingFaultyDebt),
            "lending_frozen_mode" | "frozen_mode" | "mode" => Ok(ScenarioId::LendingFrozenMode),
            "lending_unordered_queue" | "unordered_queue" | "queue" => Ok(ScenarioId::LendingUnorderedQueue),
            "lending_outage" | "outage" => Ok(ScenarioId::LendingOutage),
            "all" => Err("Use --scenario all through the CLI to run every scenario".to_string()),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
