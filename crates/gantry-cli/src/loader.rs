//! Workflow discovery and loading.

use anyhow::{Context, bail};
use gantry_core::validation;
use gantry_core::workflow::WorkflowDefinition;
use gantry_runner::BUILTIN_ACTIONS;
use std::path::{Path, PathBuf};

/// A parsed workflow and the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub path: PathBuf,
    pub definition: WorkflowDefinition,
}

/// Workflow files (`*.yml`, `*.yaml`) directly inside `dir`, sorted by name.
pub fn discover(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read workflows directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if is_yaml && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse one workflow file.
pub fn load(path: &Path) -> anyhow::Result<LoadedWorkflow> {
    let definition = WorkflowDefinition::from_path(path)?;
    Ok(LoadedWorkflow {
        path: path.to_path_buf(),
        definition,
    })
}

/// Problems that would stop a workflow from running.
pub fn issues(workflow: &WorkflowDefinition) -> Vec<String> {
    validation::collect_issues(workflow, BUILTIN_ACTIONS)
}

/// Load and validate every workflow in `dir`.
///
/// Fails on the first file that does not parse or validate; workflow names
/// must be unique across the directory.
pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<WorkflowDefinition>> {
    let mut workflows: Vec<WorkflowDefinition> = Vec::new();

    for path in discover(dir)? {
        let loaded = load(&path)?;
        let problems = issues(&loaded.definition);
        if !problems.is_empty() {
            bail!(
                "{} is invalid:\n  - {}",
                path.display(),
                problems.join("\n  - ")
            );
        }
        if workflows.iter().any(|w| w.name == loaded.definition.name) {
            bail!(
                "Duplicate workflow name '{}' in {}",
                loaded.definition.name,
                path.display()
            );
        }
        workflows.push(loaded.definition);
    }

    if workflows.is_empty() {
        bail!("No workflows found in {}", dir.display());
    }
    Ok(workflows)
}
