//! Run executor: drives one run's steps from workspace provisioning to report.

use crate::concurrency::{CancelHandle, ConcurrencyGroups, cancelled};
use crate::plan::RunPlan;
use chrono::Utc;
use gantry_core::events::{
    Event, RunCancelledPayload, RunCompletedPayload, RunStartedPayload, StepCompletedPayload,
    StepOutputPayload, StepStartedPayload,
};
use gantry_core::interpolation::InterpolationContext;
use gantry_core::ports::EventBus;
use gantry_core::run::{CancelReason, RunReport, StepRecord, StepStatus, Verdict};
use gantry_core::workflow::StepDefinition;
use gantry_core::{Error, RunId};
use gantry_runner::{EnvironmentFactory, OutputLine, StepContext, StepResult, StepRunner, WorkspaceMode};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lines of output kept per step in the run report.
pub const DEFAULT_OUTPUT_TAIL: usize = 50;

/// How long to wait for a killed step's output to drain.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

enum StepOutcome {
    Finished(StepResult),
    Errored(Error),
    Cancelled(CancelReason),
}

/// What the step loop produced.
struct StepsOutcome {
    steps: Vec<StepRecord>,
    fatal_exit_code: Option<i32>,
    cancelled: Option<CancelReason>,
}

/// Executes planned runs.
pub struct RunExecutor {
    runners: Vec<Arc<dyn StepRunner>>,
    event_bus: Arc<dyn EventBus>,
    groups: ConcurrencyGroups,
    workspace: WorkspaceMode,
    output_tail: usize,
}

impl RunExecutor {
    pub fn new(
        runners: Vec<Arc<dyn StepRunner>>,
        event_bus: Arc<dyn EventBus>,
        workspace: WorkspaceMode,
    ) -> Self {
        Self {
            runners,
            event_bus,
            groups: ConcurrencyGroups::new(),
            workspace,
            output_tail: DEFAULT_OUTPUT_TAIL,
        }
    }

    pub fn with_output_tail(mut self, lines: usize) -> Self {
        self.output_tail = lines;
        self
    }

    pub fn with_groups(mut self, groups: ConcurrencyGroups) -> Self {
        self.groups = groups;
        self
    }

    pub fn groups(&self) -> &ConcurrencyGroups {
        &self.groups
    }

    /// Execute one run to completion, cancellation or failure.
    ///
    /// Never returns an error: infrastructure problems become a failed report.
    pub async fn execute(&self, plan: RunPlan, cancel: CancelHandle) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();

        if let Some(reason) = cancel.reason() {
            debug!(run_id = %plan.run_id, "Run cancelled before start");
            let steps = skipped_steps(&plan.steps);
            return self
                .finish(&plan, steps, Verdict::Cancelled, 0, Some(reason), None, started_at, clock)
                .await;
        }

        let _slot = match self
            .groups
            .acquire(
                &plan.concurrency_key,
                plan.ticket,
                plan.run_id,
                plan.cancel_in_progress,
                &cancel,
            )
            .await
        {
            Ok(slot) => slot,
            Err(reason) => {
                cancel.cancel(reason.clone());
                let reason = cancel.reason().unwrap_or(reason);
                let steps = skipped_steps(&plan.steps);
                return self
                    .finish(&plan, steps, Verdict::Cancelled, 0, Some(reason), None, started_at, clock)
                    .await;
            }
        };

        let environment = EnvironmentFactory::create(&self.workspace, plan.run_id);
        if let Err(e) = environment.prepare().await {
            error!(run_id = %plan.run_id, error = %e, "Failed to provision workspace");
            let steps = skipped_steps(&plan.steps);
            return self
                .finish(
                    &plan,
                    steps,
                    Verdict::Failure,
                    e.exit_code(),
                    None,
                    Some(e.to_string()),
                    started_at,
                    clock,
                )
                .await;
        }

        info!(
            run_id = %plan.run_id,
            name = %plan.display_name,
            workspace = %environment.working_dir().display(),
            "Starting run"
        );
        self.publish(Event::RunStarted(RunStartedPayload {
            run_id: plan.run_id,
            workflow: plan.workflow.clone(),
            display_name: plan.display_name.clone(),
            workspace: environment.working_dir().display().to_string(),
            started_at,
        }))
        .await;

        let outcome = self
            .run_steps(&plan, environment.working_dir(), &cancel)
            .await;

        if let Err(e) = environment.cleanup().await {
            warn!(run_id = %plan.run_id, error = %e, "Failed to clean up workspace");
        }

        let (verdict, exit_code) = match (&outcome.cancelled, outcome.fatal_exit_code) {
            (Some(_), _) => (Verdict::Cancelled, 0),
            (None, Some(code)) => (Verdict::Failure, code),
            (None, None) => (Verdict::Success, 0),
        };

        self.finish(
            &plan,
            outcome.steps,
            verdict,
            exit_code,
            outcome.cancelled,
            None,
            started_at,
            clock,
        )
        .await
    }

    async fn run_steps(
        &self,
        plan: &RunPlan,
        workspace: &Path,
        cancel: &CancelHandle,
    ) -> StepsOutcome {
        let mut records: Vec<StepRecord> = plan
            .steps
            .iter()
            .map(|s| StepRecord::pending(&s.name))
            .collect();
        let mut ctx = plan.context.clone();
        let mut env = plan.env.clone();
        let mut fatal_exit_code = None;
        let mut cancelled_by = None;
        let mut cancel_rx = cancel.subscribe();
        let total_steps = plan.steps.len();

        for (index, step) in plan.steps.iter().enumerate() {
            if fatal_exit_code.is_some() || cancelled_by.is_some() {
                records[index].status = StepStatus::Skipped;
                continue;
            }
            if let Some(reason) = cancel.reason() {
                cancelled_by = Some(reason);
                records[index].status = StepStatus::Skipped;
                continue;
            }

            debug!(run_id = %plan.run_id, step = %step.name, "Starting step");
            self.publish(Event::StepStarted(StepStartedPayload {
                run_id: plan.run_id,
                step_name: step.name.clone(),
                step_index: index,
                total_steps,
                started_at: Utc::now(),
            }))
            .await;

            let step_clock = Instant::now();
            let step_ctx = StepContext {
                run_id: plan.run_id,
                workspace: workspace.to_path_buf(),
                env: env.clone(),
                step: interpolate_step(step, &ctx),
            };

            let (output_tx, output_rx) = mpsc::channel(256);
            let collector = tokio::spawn(collect_output(
                output_rx,
                self.event_bus.clone(),
                plan.run_id,
                step.name.clone(),
                index,
                self.output_tail,
            ));

            let timeout_minutes = step.timeout_minutes.unwrap_or(plan.timeout_minutes);
            let outcome = self
                .run_step(&step_ctx, output_tx, timeout_minutes, &mut cancel_rx)
                .await;

            let mut output = match tokio::time::timeout(OUTPUT_DRAIN_GRACE, collector).await {
                Ok(Ok(lines)) => lines,
                Ok(Err(e)) => {
                    warn!(step = %step.name, error = %e, "Output collector failed");
                    Vec::new()
                }
                Err(_) => {
                    debug!(step = %step.name, "Output still open after step ended");
                    Vec::new()
                }
            };

            let record = &mut records[index];
            record.duration_ms = Some(step_clock.elapsed().as_millis() as u64);

            let failure = match outcome {
                StepOutcome::Finished(result) if result.success => {
                    record.status = StepStatus::Success;
                    record.exit_code = Some(result.exit_code);
                    for (key, value) in result.outputs {
                        ctx.set_output(&step.name, &key, value);
                    }
                    for (key, value) in result.env {
                        ctx.variables.insert(key.clone(), value.clone());
                        env.insert(key, value);
                    }
                    None
                }
                StepOutcome::Finished(result) => {
                    if let Some(message) = result.error {
                        output.push(message);
                    }
                    Some(if result.exit_code == 0 { 1 } else { result.exit_code })
                }
                StepOutcome::Errored(e) => {
                    warn!(run_id = %plan.run_id, step = %step.name, error = %e, "Step errored");
                    output.push(e.to_string());
                    Some(e.exit_code())
                }
                StepOutcome::Cancelled(reason) => {
                    info!(run_id = %plan.run_id, step = %step.name, reason = %reason, "Step cancelled");
                    record.status = StepStatus::Cancelled;
                    cancelled_by = Some(reason);
                    None
                }
            };

            if let Some(exit_code) = failure {
                let non_fatal = ctx.evaluate_flag(step.continue_on_error.as_ref());
                record.status = StepStatus::Failure;
                record.exit_code = Some(exit_code);
                record.non_fatal = non_fatal;
                if non_fatal {
                    info!(step = %step.name, exit_code, "Step failed, continuing");
                } else {
                    fatal_exit_code = Some(exit_code);
                }
            }
            record.output = output;

            self.publish(Event::StepCompleted(StepCompletedPayload {
                run_id: plan.run_id,
                step_name: step.name.clone(),
                step_index: index,
                status: record.status,
                exit_code: record.exit_code,
                duration_ms: record.duration_ms.unwrap_or_default(),
            }))
            .await;
        }

        StepsOutcome {
            steps: records,
            fatal_exit_code,
            cancelled: cancelled_by,
        }
    }

    /// Run one step, racing it against cancellation and its timeout.
    ///
    /// Losing the race drops the runner's future, which kills its process.
    async fn run_step(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        timeout_minutes: u32,
        cancel_rx: &mut watch::Receiver<Option<CancelReason>>,
    ) -> StepOutcome {
        let Some(runner) = self.runners.iter().find(|r| r.can_handle(&ctx.step)) else {
            return StepOutcome::Errored(Error::Internal(format!(
                "No runner can handle step '{}'",
                ctx.step.name
            )));
        };

        let limit = Duration::from_secs(u64::from(timeout_minutes) * 60);
        tokio::select! {
            biased;
            reason = cancelled(cancel_rx) => StepOutcome::Cancelled(reason),
            result = tokio::time::timeout(limit, runner.execute(ctx, output_tx)) => match result {
                Ok(Ok(result)) => StepOutcome::Finished(result),
                Ok(Err(e)) => StepOutcome::Errored(e),
                Err(_) => StepOutcome::Errored(Error::StepTimeout { minutes: timeout_minutes }),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        plan: &RunPlan,
        steps: Vec<StepRecord>,
        verdict: Verdict,
        exit_code: i32,
        cancel_reason: Option<CancelReason>,
        error: Option<String>,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> RunReport {
        let completed_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;

        let event = match &cancel_reason {
            Some(reason) if verdict == Verdict::Cancelled => {
                Event::RunCancelled(RunCancelledPayload {
                    run_id: plan.run_id,
                    workflow: plan.workflow.clone(),
                    display_name: plan.display_name.clone(),
                    reason: reason.reason,
                    message: reason.message.clone(),
                    cancelled_at: completed_at,
                })
            }
            _ => Event::RunCompleted(RunCompletedPayload {
                run_id: plan.run_id,
                workflow: plan.workflow.clone(),
                display_name: plan.display_name.clone(),
                verdict,
                exit_code,
                completed_at,
                duration_ms,
            }),
        };
        self.publish(event).await;

        info!(
            run_id = %plan.run_id,
            name = %plan.display_name,
            verdict = %verdict,
            exit_code,
            duration_ms,
            "Run finished"
        );

        RunReport {
            run_id: plan.run_id,
            workflow: plan.workflow.clone(),
            display_name: plan.display_name.clone(),
            matrix: plan.matrix.clone(),
            concurrency_key: plan.concurrency_key.clone(),
            non_blocking: plan.non_blocking,
            verdict,
            exit_code,
            steps,
            cancel_reason: if verdict == Verdict::Cancelled {
                cancel_reason
            } else {
                None
            },
            error,
            started_at,
            completed_at,
            duration_ms,
        }
    }

    /// Report for a run whose task died before producing one.
    pub fn aborted_report(plan: &RunPlan, message: impl Into<String>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: plan.run_id,
            workflow: plan.workflow.clone(),
            display_name: plan.display_name.clone(),
            matrix: plan.matrix.clone(),
            concurrency_key: plan.concurrency_key.clone(),
            non_blocking: plan.non_blocking,
            verdict: Verdict::Failure,
            exit_code: -1,
            steps: skipped_steps(&plan.steps),
            cancel_reason: None,
            error: Some(message.into()),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    async fn publish(&self, event: Event) {
        publish(self.event_bus.as_ref(), event).await;
    }
}

async fn publish(bus: &dyn EventBus, event: Event) {
    if let Err(e) = bus.publish(event).await {
        debug!(error = %e, "Failed to publish event");
    }
}

fn skipped_steps(steps: &[StepDefinition]) -> Vec<StepRecord> {
    steps
        .iter()
        .map(|s| StepRecord {
            status: StepStatus::Skipped,
            ..StepRecord::pending(&s.name)
        })
        .collect()
}

/// Forward a step's output as events and keep the last `tail` lines.
async fn collect_output(
    mut rx: mpsc::Receiver<OutputLine>,
    bus: Arc<dyn EventBus>,
    run_id: RunId,
    step_name: String,
    step_index: usize,
    tail: usize,
) -> Vec<String> {
    let mut lines = VecDeque::with_capacity(tail.min(256));

    while let Some(line) = rx.recv().await {
        lines.push_back(line.content.clone());
        while lines.len() > tail {
            lines.pop_front();
        }

        publish(
            bus.as_ref(),
            Event::StepOutput(StepOutputPayload {
                run_id,
                step_name: step_name.clone(),
                step_index,
                stream: line.stream,
                line_number: line.line_number,
                content: line.content,
            }),
        )
        .await;
    }

    lines.into()
}

/// Resolve `${{ }}` expressions in every string field a runner reads.
fn interpolate_step(step: &StepDefinition, ctx: &InterpolationContext) -> StepDefinition {
    let mut resolved = step.clone();
    resolved.run = step.run.as_deref().map(|run| ctx.interpolate(run));
    resolved.working_directory = step
        .working_directory
        .as_deref()
        .map(|dir| ctx.interpolate(dir));
    resolved.with = step
        .with
        .iter()
        .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
        .collect();
    resolved.env = step
        .env
        .iter()
        .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
        .collect::<HashMap<_, _>>();
    resolved
}

fn interpolate_value(value: &Value, ctx: &InterpolationContext) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.interpolate(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NoopEventBus;
    use crate::plan::Planner;
    use crate::triggers::TriggerEvent;
    use gantry_core::workflow::WorkflowDefinition;

    fn executor(root: &Path) -> RunExecutor {
        RunExecutor::new(
            gantry_runner::default_runners(),
            Arc::new(NoopEventBus),
            WorkspaceMode::Scratch {
                root: root.to_path_buf(),
                keep: false,
            },
        )
    }

    fn plan(yaml: &str) -> RunPlan {
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        let mut plan = Planner::new().plan(&wf, &TriggerEvent::push("main", vec![]));
        plan.runs.remove(0)
    }

    #[test]
    fn test_interpolate_step_fields() {
        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("os".to_string(), "linux".to_string());
        let step = StepDefinition::uses("upload", "upload-coverage")
            .with_param("flags", "${{ matrix.os }}")
            .with_param("retries", 3);
        let resolved = interpolate_step(&step, &ctx);
        assert_eq!(resolved.with["flags"], Value::String("linux".to_string()));
        assert_eq!(resolved.with["retries"], Value::from(3));
    }

    #[tokio::test]
    async fn test_outputs_flow_between_steps() {
        let root = tempfile::tempdir().unwrap();
        let plan = plan(
            r#"
name: Outputs
steps:
  - name: version
    run: |
      echo "version=1.2.3" >> "$GANTRY_OUTPUT"
      echo "BUILD_MODE=release" >> "$GANTRY_ENV"
  - name: check
    run: |
      test "${{ steps.version.outputs.version }}" = "1.2.3"
      test "$BUILD_MODE" = "release"
"#,
        );

        let report = executor(root.path()).execute(plan, CancelHandle::new()).await;
        assert_eq!(report.verdict, Verdict::Success, "{:?}", report.steps);
        assert_eq!(report.executed_steps(), vec!["version", "check"]);
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let root = tempfile::tempdir().unwrap();
        let plan = plan(
            r#"
name: Failing
steps:
  - name: one
    run: echo one
  - name: two
    run: |
      echo "about to fail"
      exit 4
  - name: three
    run: echo three
"#,
        );

        let report = executor(root.path()).execute(plan, CancelHandle::new()).await;
        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.exit_code, 4);
        assert_eq!(report.steps[2].status, StepStatus::Skipped);

        let failing = report.failing_step().unwrap();
        assert_eq!(failing.name, "two");
        assert!(failing.output.iter().any(|l| l == "about to fail"));
    }

    #[tokio::test]
    async fn test_step_timeout_fails_run() {
        let root = tempfile::tempdir().unwrap();
        let mut plan = plan("name: Slow\nsteps:\n  - name: nap\n    run: exec sleep 30\n");
        plan.timeout_minutes = 0;

        let report = executor(root.path()).execute(plan, CancelHandle::new()).await;
        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.exit_code, -1);
        assert!(report.steps[0].output.iter().any(|l| l.contains("timeout")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let root = tempfile::tempdir().unwrap();
        let plan = plan("name: Never\nsteps:\n  - name: a\n    run: echo a\n");
        let cancel = CancelHandle::new();
        cancel.cancel(CancelReason::fail_fast("sibling"));

        let report = executor(root.path()).execute(plan, cancel).await;
        assert_eq!(report.verdict, Verdict::Cancelled);
        assert_eq!(report.exit_code, 0);
        assert!(report.executed_steps().is_empty());
        assert!(report.cancel_reason.is_some());
    }

    #[tokio::test]
    async fn test_cancel_kills_in_flight_step() {
        let root = tempfile::tempdir().unwrap();
        let plan = plan(
            "name: Long\nsteps:\n  - name: nap\n    run: exec sleep 30\n  - name: after\n    run: echo after\n",
        );
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel(CancelReason::superseded(RunId::new()));
        });

        let started = Instant::now();
        let report = executor(root.path()).execute(plan, cancel).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.verdict, Verdict::Cancelled);
        assert_eq!(report.steps[0].status, StepStatus::Cancelled);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_with_exit_one() {
        let root = tempfile::tempdir().unwrap();
        let plan = plan("name: Bad\nsteps:\n  - name: x\n    uses: teleport\n");

        let report = executor(root.path()).execute(plan, CancelHandle::new()).await;
        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.exit_code, 1);
        assert!(report.steps[0].output.iter().any(|l| l.contains("teleport")));
    }
}
