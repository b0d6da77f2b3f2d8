//! Lifecycle events published while a trigger is being processed.

use crate::ids::RunId;
use crate::run::{CancelReasonType, StepStatus, Verdict};
use crate::workflow::TriggerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Workflow
    WorkflowMatched(WorkflowMatchedPayload),

    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunCancelled(RunCancelledPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepCompleted(StepCompletedPayload),
}

impl Event {
    /// Dotted subject for routing and log targets.
    pub fn subject(&self) -> String {
        match self {
            Event::WorkflowMatched(p) => format!("workflow.matched.{}", p.workflow),
            Event::RunQueued(p) => format!("run.queued.{}", p.run_id),
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}", p.run_id),
            Event::StepStarted(p) => format!("run.{}.step.{}.started", p.run_id, p.step_index),
            Event::StepOutput(p) => format!("run.{}.step.{}.output", p.run_id, p.step_index),
            Event::StepCompleted(p) => {
                format!("run.{}.step.{}.completed", p.run_id, p.step_index)
            }
        }
    }

    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Event::WorkflowMatched(_) => None,
            Event::RunQueued(p) => Some(p.run_id),
            Event::RunStarted(p) => Some(p.run_id),
            Event::RunCompleted(p) => Some(p.run_id),
            Event::RunCancelled(p) => Some(p.run_id),
            Event::StepStarted(p) => Some(p.run_id),
            Event::StepOutput(p) => Some(p.run_id),
            Event::StepCompleted(p) => Some(p.run_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMatchedPayload {
    pub workflow: String,
    pub trigger: TriggerType,
    pub git_ref: String,
    pub run_count: usize,
}

// === Run Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub concurrency_key: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub workspace: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub verdict: Verdict,
    pub exit_code: i32,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub reason: CancelReasonType,
    pub message: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

// === Step Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub step_name: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutputPayload {
    pub run_id: RunId,
    pub step_name: String,
    pub step_index: usize,
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub step_name: String,
    pub step_index: usize,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = RunId::new();
        let event = Event::StepCompleted(StepCompletedPayload {
            run_id,
            step_name: "test".to_string(),
            step_index: 2,
            status: StepStatus::Failure,
            exit_code: Some(1),
            duration_ms: 10,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_completed");
        assert_eq!(json["status"], "failure");
        assert_eq!(event.subject(), format!("run.{}.step.2.completed", run_id));
        assert_eq!(event.run_id(), Some(run_id));
    }
}
