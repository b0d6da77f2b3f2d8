//! Built-in reusable actions invoked through `uses:` steps.

pub mod checkout;
pub mod setup_runtime;
pub mod upload_coverage;

use crate::runner::{OutputLine, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::workflow::StepDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Names accepted by `uses:`.
pub const BUILTIN_ACTIONS: &[&str] = &["checkout", "setup-runtime", "upload-coverage"];

/// Input passed to action execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInput {
    /// Parameters from the step's `with:` block.
    pub params: HashMap<String, serde_json::Value>,
    /// Environment of the run at this step.
    pub env: HashMap<String, String>,
    /// Run workspace.
    pub workspace: PathBuf,
    pub step_name: String,
}

impl ActionInput {
    /// A string parameter, falling back to an environment variable.
    pub fn param_or_env(&self, key: &str, env_var: &str) -> Option<String> {
        self.param(key)
            .or_else(|| self.env.get(env_var).cloned())
            .filter(|v| !v.is_empty())
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.params.get(key).map(gantry_core::workflow::render_value)
    }
}

/// Output from action execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutput {
    pub success: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Variables exported to later steps.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub error: Option<String>,
}

impl ActionOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::failure_with_code(message, 1)
    }

    pub fn failure_with_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            success: false,
            exit_code: if exit_code == 0 { 1 } else { exit_code },
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Trait for built-in actions.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the action, logging progress to `output_tx`.
    async fn execute(
        &self,
        input: &ActionInput,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ActionOutput>;
}

/// Get a built-in action by name.
pub fn get_builtin_action(name: &str) -> Option<Arc<dyn Action>> {
    match name {
        "checkout" => Some(Arc::new(checkout::CheckoutAction::new())),
        "setup-runtime" => Some(Arc::new(setup_runtime::SetupRuntimeAction::new())),
        "upload-coverage" => Some(Arc::new(upload_coverage::UploadCoverageAction::new())),
        _ => None,
    }
}

/// Step runner for `uses:` steps.
pub struct ActionRunner {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRunner {
    /// Runner with every built-in action registered.
    pub fn new() -> Self {
        let mut runner = Self::empty();
        for name in BUILTIN_ACTIONS {
            if let Some(action) = get_builtin_action(name) {
                runner.register(action);
            }
        }
        runner
    }

    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register or replace an action under its own name.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }
}

impl Default for ActionRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for ActionRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let name = ctx.step.uses.as_deref().unwrap_or_default();

        let Some(action) = self.actions.get(name) else {
            warn!(action = %name, step = %ctx.step.name, "Action not found");
            return Err(gantry_core::Error::ActionNotFound(name.to_string()));
        };

        info!(action = %name, step = %ctx.step.name, "Running action");

        let mut env = ctx.env.clone();
        env.extend(ctx.step.env.clone());
        let input = ActionInput {
            params: ctx.step.with.clone(),
            env,
            workspace: ctx.workspace.clone(),
            step_name: ctx.step.name.clone(),
        };

        let output = action.execute(&input, output_tx.clone()).await?;
        if let Some(error) = &output.error {
            let _ = output_tx.send(OutputLine::stderr(error.clone(), 0)).await;
        }

        Ok(StepResult {
            exit_code: output.exit_code,
            success: output.success,
            duration_ms: start.elapsed().as_millis() as u64,
            outputs: output.outputs,
            env: output.env,
            error: output.error,
        })
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.uses.is_some()
    }
}

/// Send an informational line from an action.
pub(crate) async fn log(output_tx: &mpsc::Sender<OutputLine>, message: impl Into<String>) {
    let _ = output_tx.send(OutputLine::stdout(message, 0)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAction;

    #[async_trait]
    impl Action for EchoAction {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            input: &ActionInput,
            output_tx: mpsc::Sender<OutputLine>,
        ) -> Result<ActionOutput> {
            let message = input.param("message").unwrap_or_default();
            log(&output_tx, message.clone()).await;
            if message == "fail" {
                return Ok(ActionOutput::failure_with_code("asked to fail", 7));
            }
            Ok(ActionOutput::success()
                .with_output("echoed", message)
                .with_env("ECHOED", "1"))
        }
    }

    fn context(step: StepDefinition) -> StepContext {
        StepContext {
            run_id: gantry_core::RunId::new(),
            workspace: PathBuf::from("."),
            env: HashMap::new(),
            step,
        }
    }

    #[tokio::test]
    async fn test_dispatches_registered_action() {
        let mut runner = ActionRunner::empty();
        runner.register(Arc::new(EchoAction));
        let (tx, mut rx) = mpsc::channel(10);

        let step = StepDefinition::uses("say", "echo").with_param("message", "hi");
        let result = runner.execute(&context(step), tx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.outputs.get("echoed"), Some(&"hi".to_string()));
        assert_eq!(result.env.get("ECHOED"), Some(&"1".to_string()));
        assert_eq!(rx.recv().await.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_action_failure_reports_exit_code_and_error() {
        let mut runner = ActionRunner::empty();
        runner.register(Arc::new(EchoAction));
        let (tx, mut rx) = mpsc::channel(10);

        let step = StepDefinition::uses("say", "echo").with_param("message", "fail");
        let result = runner.execute(&context(step), tx).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 7);
        assert_eq!(rx.recv().await.unwrap().content, "fail");
        assert_eq!(rx.recv().await.unwrap().content, "asked to fail");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let runner = ActionRunner::new();
        let (tx, _rx) = mpsc::channel(10);
        let step = StepDefinition::uses("mystery", "no-such-action");
        let err = runner.execute(&context(step), tx).await.unwrap_err();
        assert!(matches!(err, gantry_core::Error::ActionNotFound(name) if name == "no-such-action"));
    }

    #[test]
    fn test_every_builtin_is_registered() {
        for name in BUILTIN_ACTIONS {
            let action = get_builtin_action(name).unwrap();
            assert_eq!(action.name(), *name);
        }
    }

    #[test]
    fn test_param_or_env() {
        let mut input = ActionInput {
            params: HashMap::new(),
            env: HashMap::new(),
            workspace: PathBuf::from("."),
            step_name: "s".to_string(),
        };
        input
            .env
            .insert("GANTRY_REF".to_string(), "refs/heads/main".to_string());
        assert_eq!(
            input.param_or_env("ref", "GANTRY_REF").as_deref(),
            Some("refs/heads/main")
        );
        input
            .params
            .insert("ref".to_string(), serde_json::json!("v1.0"));
        assert_eq!(input.param_or_env("ref", "GANTRY_REF").as_deref(), Some("v1.0"));
    }
}
