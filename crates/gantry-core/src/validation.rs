//! Static checks on workflow definitions, run before anything executes.

use crate::workflow::WorkflowDefinition;
use crate::{Error, Result};
use globset::Glob;
use std::collections::HashSet;

/// Validate a workflow, collecting every problem into one error.
///
/// `known_actions` lists the reusable actions the runner provides; pass an
/// empty slice to skip that check.
pub fn validate(workflow: &WorkflowDefinition, known_actions: &[&str]) -> Result<()> {
    let issues = collect_issues(workflow, known_actions);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::WorkflowValidation(format!(
            "{}: {}",
            workflow.name,
            issues.join("; ")
        )))
    }
}

pub fn collect_issues(workflow: &WorkflowDefinition, known_actions: &[&str]) -> Vec<String> {
    let mut issues = Vec::new();

    if workflow.name.trim().is_empty() {
        issues.push("workflow name must not be empty".to_string());
    }
    if workflow.timeout_minutes == 0 {
        issues.push("timeout_minutes must be positive".to_string());
    }

    for trigger in &workflow.triggers {
        for pattern in trigger
            .branches
            .iter()
            .chain(&trigger.branches_ignore)
            .chain(&trigger.paths)
            .chain(&trigger.paths_ignore)
        {
            if let Err(e) = Glob::new(pattern) {
                issues.push(format!("invalid glob '{}': {}", pattern, e));
            }
        }
    }

    if let Some(concurrency) = &workflow.concurrency
        && concurrency.group.trim().is_empty()
    {
        issues.push("concurrency group must not be empty".to_string());
    }

    if let Some(matrix) = &workflow.matrix {
        if matrix.dimensions.is_empty() && matrix.include.is_empty() {
            issues.push("matrix must declare at least one dimension".to_string());
        }
        for (key, values) in &matrix.dimensions {
            if values.is_empty() {
                issues.push(format!("matrix dimension '{}' has no values", key));
            }
            if values.iter().any(|v| v.is_array() || v.is_object()) {
                issues.push(format!("matrix dimension '{}' must hold scalar values", key));
            }
        }
        if matrix.max_parallel == Some(0) {
            issues.push("matrix max_parallel must be positive".to_string());
        }
    }

    if workflow.steps.is_empty() {
        issues.push("workflow must declare at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for (idx, step) in workflow.steps.iter().enumerate() {
        let label = if step.name.is_empty() {
            format!("step #{}", idx + 1)
        } else {
            format!("step '{}'", step.name)
        };

        if step.name.trim().is_empty() {
            issues.push(format!("{} must have a name", label));
        } else if !seen.insert(step.name.as_str()) {
            issues.push(format!("{} is declared more than once", label));
        }

        match (&step.uses, &step.run) {
            (Some(_), Some(_)) => issues.push(format!("{} sets both 'uses' and 'run'", label)),
            (None, None) => issues.push(format!("{} needs either 'uses' or 'run'", label)),
            (Some(action), None) => {
                if !known_actions.is_empty() && !known_actions.contains(&action.as_str()) {
                    issues.push(format!("{} uses unknown action '{}'", label, action));
                }
            }
            (None, Some(script)) => {
                if script.trim().is_empty() {
                    issues.push(format!("{} has an empty 'run' script", label));
                }
                if step.shell.trim().is_empty() {
                    issues.push(format!("{} has an empty shell", label));
                }
            }
        }

        if step.timeout_minutes == Some(0) {
            issues.push(format!("{} timeout_minutes must be positive", label));
        }
    }

    issues
}
