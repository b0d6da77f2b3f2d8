//! Core runner trait and types.

use async_trait::async_trait;
use gantry_core::events::LogStream;
use gantry_core::{Result, RunId};
use gantry_core::workflow::StepDefinition;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: LogStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>, line_number: u32) -> Self {
        Self {
            stream: LogStream::Stdout,
            content: content.into(),
            line_number,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn stderr(content: impl Into<String>, line_number: u32) -> Self {
        Self {
            stream: LogStream::Stderr,
            ..Self::stdout(content, line_number)
        }
    }
}

/// Result of step execution.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    /// Values published for `steps.<name>.outputs.<key>`.
    pub outputs: HashMap<String, String>,
    /// Environment exported to the remaining steps of the run.
    pub env: HashMap<String, String>,
    /// Reason reported by the step itself when it failed.
    pub error: Option<String>,
}

impl StepResult {
    pub fn from_exit_code(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
            ..Default::default()
        }
    }
}

/// Context for step execution.
///
/// The step definition is already interpolated against the run's context.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
    pub step: StepDefinition,
}

impl StepContext {
    /// Directory holding this run's step output and env files.
    pub fn files_dir(&self) -> PathBuf {
        step_files_dir(&self.workspace, self.run_id)
    }
}

/// Per-run directory for step files, so runs sharing a workspace never see each other's.
pub fn step_files_dir(workspace: &Path, run_id: RunId) -> PathBuf {
    workspace
        .join(".gantry")
        .join("step-files")
        .join(run_id.to_string())
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    ///
    /// Dropping the returned future must stop any process the step started.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;

    /// Check if this runner can handle the given step.
    fn can_handle(&self, step: &StepDefinition) -> bool;
}
