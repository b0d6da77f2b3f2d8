//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow validation failed: {0}")]
    WorkflowValidation(String),

    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    // Run errors
    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    #[error("Workspace provisioning failed: {0}")]
    Provisioning(String),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {minutes} minutes")]
    StepTimeout { minutes: u32 },

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    // Action errors
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action execution failed: {0}")]
    ActionFailed(String),

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidWorkflow(err.to_string())
    }
}

impl Error {
    /// Exit code to surface for this error when it terminates a step.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::StepFailed { exit_code, .. } => *exit_code,
            Error::ActionNotFound(_) | Error::ActionFailed(_) => 1,
            _ => -1,
        }
    }
}
