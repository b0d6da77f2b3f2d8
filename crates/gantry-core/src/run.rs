//! Run and execution types.

use crate::ids::RunId;
use crate::workflow::TriggerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Final outcome of a run, or the aggregate outcome of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failure,
    Cancelled,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Failure => "failure",
            Verdict::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

/// Trigger context recorded on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    /// Fully qualified ref, e.g. `refs/heads/main`.
    pub git_ref: String,
    pub git_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReasonType {
    Superseded,
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReason {
    pub reason: CancelReasonType,
    pub message: Option<String>,
}

impl CancelReason {
    pub fn superseded(by: RunId) -> Self {
        Self {
            reason: CancelReasonType::Superseded,
            message: Some(format!("superseded by {}", by)),
        }
    }

    pub fn fail_fast(failed: &str) -> Self {
        Self {
            reason: CancelReasonType::FailFast,
            message: Some(format!("sibling run '{}' failed", failed)),
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => write!(f, "{:?}", self.reason),
        }
    }
}

/// Record of one step within a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Set when the step failed but was configured as non-fatal.
    #[serde(default)]
    pub non_fatal: bool,
    pub duration_ms: Option<u64>,
    /// Tail of the captured stdout/stderr.
    #[serde(default)]
    pub output: Vec<String>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            exit_code: None,
            non_fatal: false,
            duration_ms: None,
            output: Vec::new(),
        }
    }
}

/// Result of one matrix combination's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub matrix: BTreeMap<String, String>,
    pub concurrency_key: String,
    pub non_blocking: bool,
    pub verdict: Verdict,
    /// 0 on success, otherwise the first fatal step's exit code.
    pub exit_code: i32,
    pub steps: Vec<StepRecord>,
    pub cancel_reason: Option<CancelReason>,
    /// Infrastructure error that stopped the run before or between steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    /// The step that ended a failed run.
    pub fn failing_step(&self) -> Option<&StepRecord> {
        if self.verdict != Verdict::Failure {
            return None;
        }
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failure && !s.non_fatal)
    }

    /// Names of steps that actually started, in order.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Success | StepStatus::Failure | StepStatus::Cancelled
                )
            })
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Aggregate of all runs a workflow produced for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub runs: Vec<RunReport>,
}

impl WorkflowReport {
    /// Logical AND of the non-cancelled, blocking run verdicts.
    ///
    /// A workflow whose runs were all cancelled reports `Cancelled`.
    pub fn verdict(&self) -> Verdict {
        if !self.runs.is_empty() && self.runs.iter().all(|r| r.verdict == Verdict::Cancelled) {
            return Verdict::Cancelled;
        }
        let failed = self
            .runs
            .iter()
            .any(|r| r.verdict == Verdict::Failure && !r.non_blocking);
        if failed {
            Verdict::Failure
        } else {
            Verdict::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.verdict() != Verdict::Failure {
            return 0;
        }
        self.runs
            .iter()
            .find(|r| r.verdict == Verdict::Failure && !r.non_blocking)
            .map(|r| if r.exit_code == 0 { 1 } else { r.exit_code })
            .unwrap_or(1)
    }
}

/// Everything one trigger event produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerReport {
    pub trigger: TriggerInfo,
    pub workflows: Vec<WorkflowReport>,
}

impl TriggerReport {
    pub fn verdict(&self) -> Verdict {
        let verdicts: Vec<Verdict> = self.workflows.iter().map(|w| w.verdict()).collect();
        if verdicts.contains(&Verdict::Failure) {
            Verdict::Failure
        } else if !verdicts.is_empty() && verdicts.iter().all(|v| *v == Verdict::Cancelled) {
            Verdict::Cancelled
        } else {
            Verdict::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.workflows
            .iter()
            .map(|w| w.exit_code())
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    pub fn run_count(&self) -> usize {
        self.workflows.iter().map(|w| w.runs.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(verdict: Verdict, exit_code: i32, non_blocking: bool) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: RunId::new(),
            workflow: "Build".to_string(),
            display_name: "Build".to_string(),
            matrix: BTreeMap::new(),
            concurrency_key: "Build-refs/heads/main".to_string(),
            non_blocking,
            verdict,
            exit_code,
            steps: vec![],
            cancel_reason: None,
            error: None,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    fn workflow(runs: Vec<RunReport>) -> WorkflowReport {
        WorkflowReport {
            workflow: "Build".to_string(),
            runs,
        }
    }

    #[test]
    fn test_aggregate_all_success() {
        let wf = workflow(vec![
            report(Verdict::Success, 0, false),
            report(Verdict::Success, 0, false),
        ]);
        assert_eq!(wf.verdict(), Verdict::Success);
        assert_eq!(wf.exit_code(), 0);
    }

    #[test]
    fn test_aggregate_ignores_cancelled() {
        let wf = workflow(vec![
            report(Verdict::Cancelled, 0, false),
            report(Verdict::Success, 0, false),
        ]);
        assert_eq!(wf.verdict(), Verdict::Success);
    }

    #[test]
    fn test_aggregate_failure_surfaces_exit_code() {
        let wf = workflow(vec![
            report(Verdict::Success, 0, false),
            report(Verdict::Failure, 2, false),
        ]);
        assert_eq!(wf.verdict(), Verdict::Failure);
        assert_eq!(wf.exit_code(), 2);
    }

    #[test]
    fn test_non_blocking_failure_does_not_fail_aggregate() {
        let wf = workflow(vec![
            report(Verdict::Success, 0, false),
            report(Verdict::Failure, 1, true),
        ]);
        assert_eq!(wf.verdict(), Verdict::Success);
    }

    #[test]
    fn test_all_cancelled() {
        let wf = workflow(vec![report(Verdict::Cancelled, 0, false)]);
        assert_eq!(wf.verdict(), Verdict::Cancelled);
        assert_eq!(wf.exit_code(), 0);
    }

    #[test]
    fn test_failing_step_skips_non_fatal_failures() {
        let mut run = report(Verdict::Failure, 3, false);
        run.steps = vec![
            StepRecord {
                status: StepStatus::Failure,
                non_fatal: true,
                exit_code: Some(1),
                ..StepRecord::pending("lint")
            },
            StepRecord {
                status: StepStatus::Failure,
                exit_code: Some(3),
                ..StepRecord::pending("test")
            },
            StepRecord {
                status: StepStatus::Skipped,
                ..StepRecord::pending("upload")
            },
        ];
        assert_eq!(run.failing_step().map(|s| s.name.as_str()), Some("test"));
        assert_eq!(run.executed_steps(), vec!["lint", "test"]);
    }
}
