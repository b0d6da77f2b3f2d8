//! Workflow definition types.
//!
//! These types represent the user-authored workflow YAML configuration.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "on", alias = "triggers", default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    /// Marks every run of this workflow as non-blocking for the aggregate verdict.
    #[serde(default)]
    pub continue_on_error: Option<BooleanOrExpression>,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u32,
    pub steps: Vec<StepDefinition>,
}

fn default_timeout() -> u32 {
    360
}

impl WorkflowDefinition {
    /// Parse a workflow from YAML source.
    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load and parse a workflow file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            Error::InvalidWorkflow(msg) => {
                Error::InvalidWorkflow(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Concurrency group template, falling back to one group per workflow and ref.
    pub fn concurrency_group(&self) -> &str {
        self.concurrency
            .as_ref()
            .map(|c| c.group.as_str())
            .unwrap_or(DEFAULT_CONCURRENCY_GROUP)
    }

    /// Whether a new run supersedes an in-progress run of the same group.
    pub fn cancel_in_progress(&self) -> bool {
        self.concurrency
            .as_ref()
            .map(|c| c.cancel_in_progress)
            .unwrap_or(true)
    }
}

pub const DEFAULT_CONCURRENCY_GROUP: &str = "${{ workflow }}-${{ ref }}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub paths_ignore: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Push => "push",
            TriggerType::PullRequest => "pull_request",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    /// Reusable action to invoke (e.g. `checkout`).
    #[serde(default)]
    pub uses: Option<String>,
    /// Parameters for the action.
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
    /// Inline command sequence.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default, alias = "variables")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub continue_on_error: Option<BooleanOrExpression>,
}

fn default_shell() -> String {
    "bash".to_string()
}

impl StepDefinition {
    /// Create an inline command step.
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uses: None,
            with: HashMap::new(),
            run: Some(command.into()),
            shell: default_shell(),
            working_directory: None,
            env: HashMap::new(),
            timeout_minutes: None,
            continue_on_error: None,
        }
    }

    /// Create a reusable action step.
    pub fn uses(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            uses: Some(action.into()),
            run: None,
            ..Self::run(name, "")
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.with.insert(key.into(), value.into());
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.continue_on_error = Some(BooleanOrExpression::Boolean(true));
        self
    }

    pub fn kind(&self) -> StepKind {
        if self.uses.is_some() {
            StepKind::Action
        } else {
            StepKind::Shell
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Action,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum BooleanOrExpression {
    Boolean(bool),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    pub group: String,
    #[serde(default = "default_true")]
    pub cancel_in_progress: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

/// Render a matrix value the way it is exported to steps.
pub fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILD: &str = r#"
name: Build
on:
  - type: push
    branches: [main]
  - type: pull_request
env:
  HYPOTHESIS_PROFILE: ci
matrix:
  dimensions:
    python-version: ["3.9", "3.10"]
  fail_fast: false
steps:
  - name: Checkout
    uses: checkout
  - name: Setup python
    uses: setup-runtime
    with:
      runtime: python
      version: ${{ matrix.python-version }}
  - name: Run tests
    run: python -m pytest tests
  - name: Upload coverage
    uses: upload-coverage
    with:
      file: coverage.xml
    continue_on_error: true
"#;

    #[test]
    fn test_parse_build_workflow() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        assert_eq!(wf.name, "Build");
        assert_eq!(wf.triggers.len(), 2);
        assert_eq!(wf.triggers[1].trigger_type, TriggerType::PullRequest);
        assert_eq!(wf.timeout_minutes, 360);

        let matrix = wf.matrix.as_ref().unwrap();
        assert!(!matrix.fail_fast);
        assert_eq!(matrix.dimensions["python-version"].len(), 2);

        assert_eq!(wf.steps.len(), 4);
        assert_eq!(wf.steps[0].kind(), StepKind::Action);
        assert_eq!(wf.steps[2].kind(), StepKind::Shell);
        assert_eq!(wf.steps[2].shell, "bash");
        assert_eq!(
            wf.steps[3].continue_on_error,
            Some(BooleanOrExpression::Boolean(true))
        );
    }

    #[test]
    fn test_concurrency_defaults() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        assert_eq!(wf.concurrency_group(), DEFAULT_CONCURRENCY_GROUP);
        assert!(wf.cancel_in_progress());
    }

    #[test]
    fn test_concurrency_queue_mode() {
        let yaml = r#"
name: Deploy
concurrency:
  group: deploy
  cancel_in_progress: false
steps:
  - name: go
    run: "true"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.concurrency_group(), "deploy");
        assert!(!wf.cancel_in_progress());
    }

    #[test]
    fn test_malformed_yaml_is_invalid_workflow() {
        let err = WorkflowDefinition::from_yaml("name: [unterminated").unwrap_err();
        assert!(matches!(err, Error::InvalidWorkflow(_)));
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&serde_json::json!("3.10")), "3.10");
        assert_eq!(render_value(&serde_json::json!(3)), "3");
        assert_eq!(render_value(&serde_json::json!(true)), "true");
    }
}
