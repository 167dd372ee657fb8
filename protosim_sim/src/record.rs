//! Run record: the append-only log of a simulation run.
//!
//! The full record is written as one JSON document at the end of a run; a
//! [`StepLog`] can additionally stream each step as a JSON line while the
//! run is in progress.

use protosim_core::{ExecutionOutcome, Parameters, RuleResult, RuleTally, Snapshot, SnapshotId};
use protosim_env::AccountAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Step budget exhausted or no eligible action left
    Completed,
    /// Stopped at the first violating step
    ViolationHalted,
    /// Infrastructure fault, timeout or cancellation
    Aborted,
    /// Authoring errors found during initialization or parameter generation
    Rejected,
}

impl RunStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::ViolationHalted => "violation_halted",
            RunStatus::Aborted => "aborted",
            RunStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based step index
    pub step: u64,

    /// Actor id
    pub actor: String,

    /// Sending account
    pub account: AccountAddress,

    pub action: String,
    pub params: Parameters,
    pub pre_snapshot: SnapshotId,
    pub post_snapshot: SnapshotId,
    pub outcome: ExecutionOutcome,
    pub results: Vec<RuleResult>,
    pub tally: RuleTally,

    /// Context time when the step finished
    pub time_ms: u64,
}

impl StepRecord {
    pub fn violations(&self) -> usize {
        self.tally.violated
    }
}

/// Aggregates over all steps of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps_executed: u64,
    pub successes: u64,
    pub reverts: u64,
    pub tally: RuleTally,

    /// Executions per action name
    pub actions: BTreeMap<String, u64>,

    /// Distinct labels of violated rules, in first-seen order
    pub violated_rules: Vec<String>,

    pub final_time_ms: u64,
}

/// Complete record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub simulation_id: String,
    pub seed: u64,

    /// Built-in scenario name, when the run came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,

    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub steps: Vec<StepRecord>,
    pub snapshots: Vec<Snapshot>,
    pub summary: RunSummary,
}

impl RunRecord {
    /// Creates an empty record for a run that is starting.
    pub fn new(simulation_id: &str, seed: u64) -> Self {
        Self {
            simulation_id: simulation_id.to_string(),
            seed,
            scenario: None,
            status: RunStatus::Completed,
            reason: None,
            steps: Vec::new(),
            snapshots: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// A record for a run that never got past initialization.
    pub fn failed_init(simulation_id: &str, seed: u64, status: RunStatus, reason: impl Into<String>) -> Self {
        let mut record = Self::new(simulation_id, seed);
        record.status = status;
        record.reason = Some(reason.into());
        record
    }

    pub fn with_scenario(mut self, scenario: &str) -> Self {
        self.scenario = Some(scenario.to_string());
        self
    }

    /// Appends a step and folds it into the summary.
    pub fn push_step(&mut self, step: StepRecord) {
        let summary = &mut self.summary;
        summary.steps_executed += 1;
        match &step.outcome {
            ExecutionOutcome::Success { .. } => summary.successes += 1,
            ExecutionOutcome::Reverted { .. } => summary.reverts += 1,
            ExecutionOutcome::InfrastructureError { .. } => {}
        }
        summary.tally.merge(&step.tally);
        *summary.actions.entry(step.action.clone()).or_default() += 1;
        for result in step.results.iter().filter(|r| r.is_violation()) {
            if !summary.violated_rules.contains(&result.label) {
                summary.violated_rules.push(result.label.clone());
            }
        }
        summary.final_time_ms = step.time_ms;
        self.steps.push(step);
    }

    /// Sets the terminal state.
    pub fn finish(&mut self, status: RunStatus, reason: Option<String>, snapshots: Vec<Snapshot>) {
        self.status = status;
        self.reason = reason;
        self.snapshots = snapshots;
    }

    /// Total violated rule results across all steps.
    pub fn violations(&self) -> usize {
        self.summary.tally.violated
    }

    /// Process exit code for this record.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed if self.violations() == 0 => 0,
            RunStatus::Completed => 1,
            RunStatus::ViolationHalted => 2,
            RunStatus::Aborted => 3,
            RunStatus::Rejected => 4,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Append-only JSON-lines log of completed steps.
pub struct StepLog {
    writer: BufWriter<File>,
}

impl StepLog {
    /// Creates (or truncates) the log file.
    pub fn create(path: &str) -> std::io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    /// Appends one step and flushes, so the log survives an abort.
    pub fn append(&mut self, step: &StepRecord) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, step)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protosim_core::{RuleKind, RuleStatus};

    fn step(n: u64, violated: bool) -> StepRecord {
        let results = vec![if violated {
            RuleResult::violated("Debt #1", RuleKind::ValidationRule, "mismatch")
        } else {
            RuleResult::satisfied("Debt #1", RuleKind::ValidationRule)
        }];
        StepRecord {
            step: n,
            actor: "Borrower#0".into(),
            account: AccountAddress::parse("0xaa"),
            action: "borrow".into(),
            params: Parameters::new(),
            pre_snapshot: SnapshotId::pre(n),
            post_snapshot: SnapshotId::post(n),
            outcome: ExecutionOutcome::Success { outputs: BTreeMap::new() },
            tally: RuleTally::from_results(&results),
            results,
            time_ms: n * 1000,
        }
    }

    #[test]
    fn test_summary_accumulates() {
        let mut record = RunRecord::new("sim", 1);
        record.push_step(step(1, false));
        record.push_step(step(2, true));
        record.push_step(step(3, true));

        assert_eq!(record.summary.steps_executed, 3);
        assert_eq!(record.summary.successes, 3);
        assert_eq!(record.summary.actions.get("borrow"), Some(&3));
        assert_eq!(record.violations(), 2);
        assert_eq!(record.summary.violated_rules, vec!["Debt #1".to_string()]);
        assert_eq!(record.summary.final_time_ms, 3000);
        assert_eq!(record.steps[1].results[0].status, RuleStatus::Violated);
    }

    #[test]
    fn test_exit_codes() {
        let mut record = RunRecord::new("sim", 1);
        assert_eq!(record.exit_code(), 0);
        record.push_step(step(1, true));
        assert_eq!(record.exit_code(), 1);
        record.finish(RunStatus::ViolationHalted, None, Vec::new());
        assert_eq!(record.exit_code(), 2);
        record.finish(RunStatus::Aborted, Some("down".into()), Vec::new());
        assert_eq!(record.exit_code(), 3);
        let rejected = RunRecord::failed_init("sim", 1, RunStatus::Rejected, "bad model");
        assert_eq!(rejected.exit_code(), 4);
    }

    #[test]
    fn test_record_json_shape() {
        let mut record = RunRecord::new("sim-7", 7).with_scenario("lending");
        record.push_step(step(1, false));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["simulation_id"], "sim-7");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["steps"][0]["pre_snapshot"]["phase"], "pre");
        assert!(json.get("reason").is_none());

        let back: RunRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_step_log_writes_lines() {
        let path = std::env::temp_dir().join(format!("protosim-steplog-{}.jsonl", std::process::id()));
        let path = path.to_string_lossy().to_string();
        {
            let mut log = StepLog::create(&path).unwrap();
            log.append(&step(1, false)).unwrap();
            log.append(&step(2, true)).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: StepRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.step, 2);
        std::fs::remove_file(&path).unwrap();
    }
}
