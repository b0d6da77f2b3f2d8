//! Run planning: turns a matched workflow into concrete per-run plans.

use crate::matrix::{MatrixExpander, MatrixJob};
use crate::triggers::TriggerEvent;
use gantry_core::RunId;
use gantry_core::interpolation::InterpolationContext;
use gantry_core::run::TriggerInfo;
use gantry_core::workflow::{StepDefinition, WorkflowDefinition};
use std::collections::{BTreeMap, HashMap};

/// Everything needed to execute one matrix combination.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    pub workflow: String,
    pub display_name: String,
    pub index: usize,
    pub matrix: BTreeMap<String, String>,
    /// Environment shared by every step of the run.
    pub env: HashMap<String, String>,
    /// Interpolation context seeded with trigger, matrix and env values.
    pub context: InterpolationContext,
    pub concurrency_key: String,
    pub cancel_in_progress: bool,
    pub non_blocking: bool,
    pub timeout_minutes: u32,
    /// Step definitions as written; interpolated right before each step runs.
    pub steps: Vec<StepDefinition>,
    /// Arrival order within the concurrency group, assigned when the trigger is accepted.
    pub ticket: u64,
}

/// All runs one workflow produces for one trigger.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub workflow: String,
    pub runs: Vec<RunPlan>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

/// Builds run plans from workflows and trigger events.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    /// Variables exported to every run ahead of workflow env, e.g. `GANTRY_REPOSITORY`.
    base_env: HashMap<String, String>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    pub fn trigger_info(event: &TriggerEvent) -> TriggerInfo {
        TriggerInfo {
            trigger_type: event.trigger_type(),
            git_ref: event.git_ref(),
            git_sha: event.sha().map(String::from),
        }
    }

    /// Plan every run of a workflow for an event.
    pub fn plan(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> WorkflowPlan {
        let expansion = MatrixExpander::new().expand(workflow);

        let runs = expansion
            .jobs
            .iter()
            .map(|job| self.plan_run(workflow, event, job))
            .collect();

        WorkflowPlan {
            workflow: workflow.name.clone(),
            runs,
            fail_fast: expansion.fail_fast,
            max_parallel: expansion.max_parallel,
        }
    }

    fn plan_run(
        &self,
        workflow: &WorkflowDefinition,
        event: &TriggerEvent,
        job: &MatrixJob,
    ) -> RunPlan {
        let run_id = RunId::new();
        let matrix = job.rendered();

        let mut context = InterpolationContext::new();
        context.trigger = trigger_context(workflow, event);
        context.matrix = matrix.clone().into_iter().collect();

        let mut env = self.base_env.clone();
        context.variables = env.clone();

        for (key, value) in &workflow.env {
            let value = context.interpolate(value);
            context.variables.insert(key.clone(), value.clone());
            env.insert(key.clone(), value);
        }

        for (key, value) in &matrix {
            env.insert(format!("MATRIX_{}", env_key(key)), value.clone());
        }

        for (key, value) in &context.trigger {
            env.insert(format!("GANTRY_{}", env_key(key)), value.clone());
        }
        env.insert("GANTRY_RUN_ID".to_string(), run_id.to_string());
        env.insert("GANTRY_RUN_NAME".to_string(), job.display_name.clone());
        env.insert("CI".to_string(), "true".to_string());
        context.variables = env.clone();

        let concurrency_key = concurrency_key(&context.interpolate(workflow.concurrency_group()), &matrix);
        let non_blocking = context.evaluate_flag(workflow.continue_on_error.as_ref());

        RunPlan {
            run_id,
            workflow: workflow.name.clone(),
            display_name: job.display_name.clone(),
            index: job.index,
            matrix,
            env,
            context,
            concurrency_key,
            cancel_in_progress: workflow.cancel_in_progress(),
            non_blocking,
            timeout_minutes: workflow.timeout_minutes,
            steps: workflow.steps.clone(),
            ticket: 0,
        }
    }
}

/// Values reachable as `${{ workflow }}`, `${{ ref }}` and friends.
fn trigger_context(workflow: &WorkflowDefinition, event: &TriggerEvent) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("workflow".to_string(), workflow.name.clone());
    ctx.insert("event_name".to_string(), event.trigger_type().to_string());
    ctx.insert("ref".to_string(), event.git_ref());
    ctx.insert("ref_name".to_string(), event.ref_name().to_string());
    if let Some(sha) = event.sha() {
        ctx.insert("sha".to_string(), sha.to_string());
    }
    if let TriggerEvent::PullRequest {
        source_branch,
        target_branch,
        ..
    } = event
    {
        ctx.insert("head_ref".to_string(), source_branch.clone());
        ctx.insert("base_ref".to_string(), target_branch.clone());
    }
    ctx
}

fn concurrency_key(group: &str, matrix: &BTreeMap<String, String>) -> String {
    if matrix.is_empty() {
        return group.to_string();
    }
    let parts: Vec<String> = matrix.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}/{}", group, parts.join(","))
}

/// `python-version` -> `PYTHON_VERSION`
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BUILD: &str = r#"
name: Build
on:
  - type: push
    branches: [main]
env:
  HYPOTHESIS_PROFILE: ci
  TOX_ENV: "py${{ matrix.python-version }}"
matrix:
  dimensions:
    python-version: ["3.9", "3.10"]
  fail_fast: false
steps:
  - name: checkout
    uses: checkout
  - name: test
    run: tox -e ${{ env.TOX_ENV }}
"#;

    fn push_main() -> TriggerEvent {
        TriggerEvent::push("main", vec!["src/lib.py".to_string()]).with_sha("abc123")
    }

    #[test]
    fn test_plan_one_run_per_combination() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        let plan = Planner::new().plan(&wf, &push_main());

        assert_eq!(plan.runs.len(), 2);
        assert!(!plan.fail_fast);
        assert_eq!(plan.runs[0].display_name, "Build (python-version=3.9)");
        assert_eq!(plan.runs[1].index, 1);
    }

    #[test]
    fn test_plan_env_layers() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        let plan = Planner::new()
            .with_base_env(HashMap::from([(
                "GANTRY_REPOSITORY".to_string(),
                "/srv/repo".to_string(),
            )]))
            .plan(&wf, &push_main());
        let env = &plan.runs[1].env;

        assert_eq!(env["HYPOTHESIS_PROFILE"], "ci");
        assert_eq!(env["TOX_ENV"], "py3.10");
        assert_eq!(env["MATRIX_PYTHON_VERSION"], "3.10");
        assert_eq!(env["GANTRY_REF"], "refs/heads/main");
        assert_eq!(env["GANTRY_REF_NAME"], "main");
        assert_eq!(env["GANTRY_SHA"], "abc123");
        assert_eq!(env["GANTRY_EVENT_NAME"], "push");
        assert_eq!(env["GANTRY_WORKFLOW"], "Build");
        assert_eq!(env["GANTRY_REPOSITORY"], "/srv/repo");
        assert_eq!(env["GANTRY_RUN_NAME"], "Build (python-version=3.10)");
    }

    #[test]
    fn test_concurrency_key_includes_matrix() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        let plan = Planner::new().plan(&wf, &push_main());

        assert_eq!(
            plan.runs[0].concurrency_key,
            "Build-refs/heads/main/python-version=3.9"
        );
        assert_ne!(plan.runs[0].concurrency_key, plan.runs[1].concurrency_key);
        assert!(plan.runs[0].cancel_in_progress);
    }

    #[test]
    fn test_custom_concurrency_group() {
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: Deploy
concurrency:
  group: deploy-${{ ref_name }}
  cancel_in_progress: false
steps:
  - name: deploy
    run: ./deploy.sh
"#,
        )
        .unwrap();
        let plan = Planner::new().plan(&wf, &push_main());

        assert_eq!(plan.runs[0].concurrency_key, "deploy-main");
        assert!(!plan.runs[0].cancel_in_progress);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        let planner = Planner::new();
        let first = planner.plan(&wf, &push_main());
        let second = planner.plan(&wf, &push_main());

        for (a, b) in first.runs.iter().zip(&second.runs) {
            assert_eq!(a.steps, b.steps);
            assert_eq!(a.display_name, b.display_name);
            assert_eq!(a.concurrency_key, b.concurrency_key);
            let strip = |env: &HashMap<String, String>| {
                let mut env = env.clone();
                env.remove("GANTRY_RUN_ID");
                env.into_iter().collect::<BTreeMap<_, _>>()
            };
            assert_eq!(strip(&a.env), strip(&b.env));
        }
    }

    #[test]
    fn test_non_blocking_from_expression() {
        let wf = WorkflowDefinition::from_yaml(
            r#"
name: Nightly
continue_on_error: "${{ matrix.channel }} == nightly"
matrix:
  dimensions:
    channel: [stable, nightly]
steps:
  - name: test
    run: cargo test
"#,
        )
        .unwrap();
        let plan = Planner::new().plan(&wf, &push_main());
        let flags: Vec<_> = plan.runs.iter().map(|r| r.non_blocking).collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_pull_request_context() {
        let wf = WorkflowDefinition::from_yaml(BUILD).unwrap();
        let event = TriggerEvent::pull_request("fix/flaky", "main", vec![]);
        let plan = Planner::new().plan(&wf, &event);
        let env = &plan.runs[0].env;
        assert_eq!(env["GANTRY_EVENT_NAME"], "pull_request");
        assert_eq!(env["GANTRY_HEAD_REF"], "fix/flaky");
        assert_eq!(env["GANTRY_BASE_REF"], "main");
    }
}
