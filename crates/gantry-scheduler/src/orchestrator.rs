//! Orchestrator: turns one trigger event into runs and a verdict.

use crate::concurrency::{CancelHandle, cancelled};
use crate::executor::{DEFAULT_OUTPUT_TAIL, RunExecutor};
use crate::plan::{Planner, WorkflowPlan};
use crate::triggers::{TriggerEvent, TriggerMatcher};
use chrono::Utc;
use futures::future::join_all;
use gantry_core::events::{Event, RunQueuedPayload, WorkflowMatchedPayload};
use gantry_core::ports::EventBus;
use gantry_core::run::{CancelReason, RunReport, TriggerReport, Verdict, WorkflowReport};
use gantry_core::workflow::WorkflowDefinition;
use gantry_runner::{StepRunner, WorkspaceMode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace: WorkspaceMode,
    /// Exported to every run, e.g. `GANTRY_REPOSITORY` or `GANTRY_COVERAGE_URL`.
    pub base_env: HashMap<String, String>,
    pub output_tail: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceMode::default(),
            base_env: HashMap::new(),
            output_tail: DEFAULT_OUTPUT_TAIL,
        }
    }
}

/// Owns the loaded workflows and everything one process needs to run them.
///
/// Share it behind an `Arc` to process several triggers at once; runs from
/// different triggers meet in the same concurrency groups.
pub struct Orchestrator {
    workflows: Vec<WorkflowDefinition>,
    matcher: TriggerMatcher,
    planner: Planner,
    executor: Arc<RunExecutor>,
    event_bus: Arc<dyn EventBus>,
}

impl Orchestrator {
    pub fn new(
        workflows: Vec<WorkflowDefinition>,
        runners: Vec<Arc<dyn StepRunner>>,
        event_bus: Arc<dyn EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        let executor = RunExecutor::new(runners, event_bus.clone(), config.workspace)
            .with_output_tail(config.output_tail);
        Self {
            workflows,
            matcher: TriggerMatcher::new(),
            planner: Planner::new().with_base_env(config.base_env),
            executor: Arc::new(executor),
            event_bus,
        }
    }

    pub fn workflows(&self) -> &[WorkflowDefinition] {
        &self.workflows
    }

    /// Workflows whose triggers accept the event.
    pub fn matching(&self, event: &TriggerEvent) -> Vec<&WorkflowDefinition> {
        self.workflows
            .iter()
            .filter(|wf| self.matcher.matches(wf, event))
            .collect()
    }

    /// Plan every run the event would start, without executing anything.
    pub fn plan(&self, event: &TriggerEvent) -> Vec<WorkflowPlan> {
        self.matching(event)
            .into_iter()
            .map(|wf| self.planner.plan(wf, event))
            .collect()
    }

    /// Match, plan and execute everything one event triggers.
    pub async fn handle_trigger(&self, event: TriggerEvent) -> TriggerReport {
        let trigger = Planner::trigger_info(&event);
        let mut plans = self.plan(&event);

        info!(
            event = %trigger.trigger_type,
            git_ref = %trigger.git_ref,
            matched = plans.len(),
            total = self.workflows.len(),
            "Handling trigger"
        );

        for plan in &mut plans {
            for run in &mut plan.runs {
                run.ticket = self
                    .executor
                    .groups()
                    .reserve(&run.concurrency_key, run.run_id);
            }
            self.publish(Event::WorkflowMatched(WorkflowMatchedPayload {
                workflow: plan.workflow.clone(),
                trigger: trigger.trigger_type,
                git_ref: trigger.git_ref.clone(),
                run_count: plan.runs.len(),
            }))
            .await;
        }

        let workflows = join_all(plans.into_iter().map(|plan| self.execute_workflow(plan))).await;

        TriggerReport { trigger, workflows }
    }

    async fn execute_workflow(&self, plan: WorkflowPlan) -> WorkflowReport {
        let semaphore = plan
            .max_parallel
            .map(|limit| Arc::new(Semaphore::new(limit.max(1) as usize)));
        let handles: Vec<CancelHandle> = plan.runs.iter().map(|_| CancelHandle::new()).collect();
        let mut reports: Vec<Option<RunReport>> = plan.runs.iter().map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for (slot, (run, cancel)) in plan.runs.iter().zip(&handles).enumerate() {
            self.publish(Event::RunQueued(RunQueuedPayload {
                run_id: run.run_id,
                workflow: run.workflow.clone(),
                display_name: run.display_name.clone(),
                concurrency_key: run.concurrency_key.clone(),
                queued_at: Utc::now(),
            }))
            .await;

            let executor = self.executor.clone();
            let semaphore = semaphore.clone();
            let run = run.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => {
                        let mut cancel_rx = cancel.subscribe();
                        tokio::select! {
                            permit = semaphore.acquire_owned() => permit.ok(),
                            _ = cancelled(&mut cancel_rx) => None,
                        }
                    }
                    None => None,
                };
                (slot, executor.execute(run, cancel).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (slot, report) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(workflow = %plan.workflow, error = %e, "Run task failed");
                    continue;
                }
            };

            if plan.fail_fast && report.verdict == Verdict::Failure && !report.non_blocking {
                for (other, handle) in handles.iter().enumerate() {
                    if other != slot
                        && reports[other].is_none()
                        && handle.cancel(CancelReason::fail_fast(&report.display_name))
                    {
                        debug!(run_id = %plan.runs[other].run_id, "Cancelling sibling run");
                    }
                }
                warn!(
                    workflow = %plan.workflow,
                    failed = %report.display_name,
                    "Run failed, cancelling remaining matrix runs"
                );
            }

            reports[slot] = Some(report);
        }

        let runs = reports
            .into_iter()
            .zip(&plan.runs)
            .map(|(report, run)| {
                report.unwrap_or_else(|| RunExecutor::aborted_report(run, "run task aborted"))
            })
            .collect();

        let report = WorkflowReport {
            workflow: plan.workflow,
            runs,
        };
        info!(
            workflow = %report.workflow,
            verdict = %report.verdict(),
            exit_code = report.exit_code(),
            "Workflow finished"
        );
        report
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            debug!(error = %e, "Failed to publish event");
        }
    }
}
