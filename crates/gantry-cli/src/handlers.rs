//! Command handlers.

use crate::commands::{EventKind, TriggerArgs};
use crate::config::{CliConfig, OutputFormat};
use crate::loader;
use anyhow::Context;
use console::style;
use gantry_core::events::Event;
use gantry_core::ports::EventBus;
use gantry_core::run::{RunReport, StepStatus, TriggerReport, Verdict};
use gantry_core::workflow::WorkflowDefinition;
use gantry_runner::WorkspaceMode;
use gantry_scheduler::{
    ChannelEventBus, LogEventBus, MatrixExpander, Orchestrator, OrchestratorConfig, Planner,
    TriggerEvent, TriggerMatcher, WorkflowPlan,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lines of a failing step's output shown in the summary.
const SUMMARY_TAIL: usize = 10;

const STARTER_WORKFLOW: &str = r#"name: Build

on:
  - type: push
    branches: [main]
  - type: pull_request
    paths: ["src/**", "tests/**"]

env:
  HYPOTHESIS_PROFILE: ci

matrix:
  dimensions:
    python-version: ["3.9", "3.10"]
  fail_fast: false

steps:
  - name: checkout
    uses: checkout

  - name: setup python
    uses: setup-runtime
    with:
      runtime: python
      version: ${{ matrix.python-version }}

  - name: test
    run: |
      python -m pip install tox
      tox -e py

  - name: upload coverage
    uses: upload-coverage
    continue_on_error: true
    with:
      file: coverage.xml
      flags: python-${{ matrix.python-version }}
"#;

/// Create a starter workflow.
pub fn init(config: &CliConfig, force: bool) -> anyhow::Result<i32> {
    let path = config.workflows_dir.join("build.yml");

    if path.exists() && !force {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(0);
    }

    std::fs::create_dir_all(&config.workflows_dir)?;
    std::fs::write(&path, STARTER_WORKFLOW)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(0)
}

/// Validate workflow files.
pub fn validate(config: &CliConfig, paths: &[PathBuf]) -> anyhow::Result<i32> {
    let paths = if paths.is_empty() {
        loader::discover(&config.workflows_dir)?
    } else {
        paths.to_vec()
    };

    if paths.is_empty() {
        println!(
            "{} No workflows found in {}",
            style("!").yellow(),
            config.workflows_dir.display()
        );
        return Ok(1);
    }

    let mut invalid = 0;
    for path in &paths {
        let loaded = match loader::load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                println!("{} {}", style("✗").red(), e);
                invalid += 1;
                continue;
            }
        };

        let issues = loader::issues(&loaded.definition);
        if issues.is_empty() {
            print_valid(&loaded.path, &loaded.definition);
        } else {
            invalid += 1;
            println!(
                "{} {} ({})",
                style("✗").red(),
                style(&loaded.definition.name).bold(),
                loaded.path.display()
            );
            for issue in issues {
                println!("    - {}", issue);
            }
        }
    }

    Ok(if invalid == 0 { 0 } else { 1 })
}

fn print_valid(path: &Path, workflow: &WorkflowDefinition) {
    let runs = MatrixExpander::new().expand(workflow).jobs.len();
    println!(
        "{} Workflow \"{}\" is valid ({})",
        style("✓").green(),
        workflow.name,
        style(path.display()).dim()
    );
    println!(
        "  Triggers: {}, runs per event: {}, steps: {}",
        workflow.triggers.len(),
        runs,
        workflow.steps.len()
    );
    for step in &workflow.steps {
        let kind = match (&step.uses, &step.run) {
            (Some(action), _) => format!("uses {}", action),
            _ => "run".to_string(),
        };
        println!("    - {} ({})", step.name, style(kind).dim());
    }
}

/// Show the runs an event would start.
pub fn plan(config: &CliConfig, trigger: &TriggerArgs) -> anyhow::Result<i32> {
    let workflows = loader::load_dir(&workflows_dir(config, trigger))?;
    let event = trigger_event(trigger);
    let matcher = TriggerMatcher::new();
    let planner = Planner::new().with_base_env(config.base_env());

    let plans: Vec<WorkflowPlan> = workflows
        .iter()
        .filter(|wf| matcher.matches(wf, &event))
        .map(|wf| planner.plan(wf, &event))
        .collect();

    match config.output_format {
        OutputFormat::Text => print_plans(&event, &plans),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans_json(&plans))?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&plans_json(&plans))?),
    }
    Ok(0)
}

fn print_plans(event: &TriggerEvent, plans: &[WorkflowPlan]) {
    if plans.is_empty() {
        println!(
            "{} No workflow matches {} on {}",
            style("i").blue(),
            event.trigger_type(),
            event.git_ref()
        );
        return;
    }

    for plan in plans {
        println!(
            "{} {} ({} runs, fail_fast: {}, max_parallel: {})",
            style("▶").cyan().bold(),
            style(&plan.workflow).bold(),
            plan.runs.len(),
            plan.fail_fast,
            plan.max_parallel
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );
        for run in &plan.runs {
            println!("  {} {}", style("━━▶").cyan(), run.display_name);
            println!("      group: {}", style(&run.concurrency_key).dim());
            if run.non_blocking {
                println!("      {}", style("non-blocking").yellow());
            }
            for step in &run.steps {
                println!("      - {}", step.name);
            }
        }
    }
}

fn plans_json(plans: &[WorkflowPlan]) -> serde_json::Value {
    let workflows: Vec<_> = plans
        .iter()
        .map(|plan| {
            let runs: Vec<_> = plan
                .runs
                .iter()
                .map(|run| {
                    json!({
                        "display_name": run.display_name,
                        "matrix": run.matrix,
                        "concurrency_key": run.concurrency_key,
                        "cancel_in_progress": run.cancel_in_progress,
                        "non_blocking": run.non_blocking,
                        "steps": run.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            json!({
                "workflow": plan.workflow,
                "fail_fast": plan.fail_fast,
                "max_parallel": plan.max_parallel,
                "runs": runs,
            })
        })
        .collect();
    json!({ "workflows": workflows })
}

/// Simulate an event and execute every run it triggers.
pub async fn run(
    config: &CliConfig,
    trigger: &TriggerArgs,
    keep_workspace: bool,
    in_place: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let workflows = loader::load_dir(&workflows_dir(config, trigger))?;
    let event = trigger_event(trigger);

    let workspace = match in_place {
        Some(dir) => WorkspaceMode::InPlace(
            std::fs::canonicalize(&dir)
                .with_context(|| format!("Cannot use {} as workspace", dir.display()))?,
        ),
        None => WorkspaceMode::Scratch {
            root: config
                .workspace_root
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("gantry")),
            keep: keep_workspace || config.keep_workspaces,
        },
    };

    let mut base_env = config.base_env();
    if !base_env.contains_key("GANTRY_REPOSITORY")
        && let Some(repository) = current_repository()
    {
        base_env.insert("GANTRY_REPOSITORY".to_string(), repository);
    }

    let text = config.output_format == OutputFormat::Text;
    let (bus, printer): (Arc<dyn EventBus>, Option<JoinHandle<()>>) = if text {
        let (bus, rx) = ChannelEventBus::new();
        (Arc::new(bus), Some(spawn_printer(rx)))
    } else {
        (Arc::new(LogEventBus), None)
    };

    let orchestrator = Orchestrator::new(
        workflows,
        gantry_runner::default_runners(),
        bus,
        OrchestratorConfig {
            workspace,
            base_env,
            ..Default::default()
        },
    );
    let report = orchestrator.handle_trigger(event).await;
    drop(orchestrator);

    if let Some(mut printer) = printer
        && tokio::time::timeout(Duration::from_secs(2), &mut printer)
            .await
            .is_err()
    {
        printer.abort();
    }

    match config.output_format {
        OutputFormat::Text => print_summary(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
    }

    Ok(report.exit_code())
}

fn spawn_printer(mut rx: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut names = HashMap::new();
        while let Some(event) = rx.recv().await {
            if let Event::RunQueued(p) = &event {
                names.insert(p.run_id, p.display_name.clone());
            }
            let prefix = event
                .run_id()
                .and_then(|id| names.get(&id))
                .map(|name| format!("[{}]", name))
                .unwrap_or_default();
            print_event(&prefix, &event);
        }
    })
}

fn print_event(prefix: &str, event: &Event) {
    let prefix = style(prefix).dim();
    match event {
        Event::WorkflowMatched(p) => println!(
            "{} {} ({} runs)",
            style("▶").cyan().bold(),
            style(&p.workflow).bold(),
            p.run_count
        ),
        Event::RunQueued(_) => {}
        Event::RunStarted(_) => println!("{} {}", prefix, style("started").cyan()),
        Event::StepStarted(p) => println!(
            "{} {} [{}/{}] {}",
            prefix,
            style("→").cyan(),
            p.step_index + 1,
            p.total_steps,
            p.step_name
        ),
        Event::StepOutput(p) => println!("{}     {}", prefix, p.content),
        Event::StepCompleted(p) => {
            let secs = p.duration_ms as f64 / 1000.0;
            match p.status {
                StepStatus::Success => println!(
                    "{} {} {} ({:.2}s)",
                    prefix,
                    style("✓").green(),
                    p.step_name,
                    secs
                ),
                StepStatus::Cancelled => {
                    println!("{} {} {} cancelled", prefix, style("⊘").yellow(), p.step_name)
                }
                _ => println!(
                    "{} {} {} (exit code {})",
                    prefix,
                    style("✗").red(),
                    p.step_name,
                    p.exit_code.unwrap_or(-1)
                ),
            }
        }
        Event::RunCompleted(p) => println!("{} {}", prefix, verdict_label(p.verdict)),
        Event::RunCancelled(p) => println!(
            "{} {} {}",
            prefix,
            verdict_label(Verdict::Cancelled),
            style(p.message.as_deref().unwrap_or_default()).dim()
        ),
    }
}

fn verdict_label(verdict: Verdict) -> String {
    match verdict {
        Verdict::Success => style("success").green().bold().to_string(),
        Verdict::Failure => style("failure").red().bold().to_string(),
        Verdict::Cancelled => style("cancelled").yellow().bold().to_string(),
    }
}

fn print_summary(report: &TriggerReport) {
    println!();
    if report.workflows.is_empty() {
        println!(
            "{} No workflow matches {} on {}",
            style("i").blue(),
            report.trigger.trigger_type,
            report.trigger.git_ref
        );
        return;
    }

    for workflow in &report.workflows {
        println!(
            "{} {}",
            style(&workflow.workflow).bold(),
            verdict_label(workflow.verdict())
        );
        for run in &workflow.runs {
            print_run_summary(run);
        }
    }

    println!();
    match report.verdict() {
        Verdict::Failure => println!(
            "{} Failed with exit code {}",
            style("✗").red().bold(),
            report.exit_code()
        ),
        Verdict::Cancelled => println!("{} All runs were cancelled", style("⊘").yellow().bold()),
        Verdict::Success => println!(
            "{} {} runs passed",
            style("✓").green().bold(),
            report.run_count()
        ),
    }
}

fn print_run_summary(run: &RunReport) {
    let note = if run.non_blocking { " (non-blocking)" } else { "" };
    println!(
        "  {} {}{} {:.2}s",
        verdict_label(run.verdict),
        run.display_name,
        style(note).dim(),
        run.duration_ms as f64 / 1000.0
    );

    if let Some(error) = &run.error {
        println!("      {}", style(error).red());
    }
    if let Some(step) = run.failing_step() {
        println!(
            "      step {} exited with {}",
            style(&step.name).bold(),
            step.exit_code.unwrap_or(-1)
        );
        let skip = step.output.len().saturating_sub(SUMMARY_TAIL);
        for line in &step.output[skip..] {
            println!("      {}", style(line).dim());
        }
    }
}

/// Print the JSON schema of the workflow format.
pub fn schema(output: Option<&Path>) -> anyhow::Result<i32> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    let rendered = serde_json::to_string_pretty(&schema)?;
    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!("{} Wrote {}", style("✓").green(), path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(0)
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<i32> {
    let unset = || "(not set)".to_string();
    println!("Current configuration:");
    println!("  workflows_dir: {}", config.workflows_dir.display());
    println!(
        "  workspace_root: {}",
        config
            .workspace_root
            .as_ref()
            .map_or_else(unset, |p| p.display().to_string())
    );
    println!("  keep_workspaces: {}", config.keep_workspaces);
    println!(
        "  repository: {}",
        config.repository.clone().unwrap_or_else(unset)
    );
    println!(
        "  coverage_url: {}",
        config.coverage_url.clone().unwrap_or_else(unset)
    );
    println!("  output_format: {:?}", config.output_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(0)
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<i32> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value).map_err(anyhow::Error::msg)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(0)
}

fn workflows_dir(config: &CliConfig, trigger: &TriggerArgs) -> PathBuf {
    trigger
        .workflows
        .clone()
        .unwrap_or_else(|| config.workflows_dir.clone())
}

/// Build the simulated event from command-line flags.
pub fn trigger_event(args: &TriggerArgs) -> TriggerEvent {
    let event = match args.event {
        EventKind::Push => TriggerEvent::push(args.branch.clone(), args.changed.clone()),
        EventKind::PullRequest => TriggerEvent::PullRequest {
            number: args.number,
            source_branch: args.branch.clone(),
            target_branch: args.base.clone(),
            paths_changed: args.changed.clone(),
            sha: None,
        },
    };
    match &args.sha {
        Some(sha) => event.with_sha(sha.clone()),
        None => event,
    }
}

/// The current directory, when it is the root of a git checkout.
fn current_repository() -> Option<String> {
    let dir = std::env::current_dir().ok()?;
    dir.join(".git")
        .exists()
        .then(|| dir.display().to_string())
}
