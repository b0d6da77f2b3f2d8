//! Trigger matching and evaluation.

use gantry_core::workflow::{TriggerConfig, TriggerType, WorkflowDefinition};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Event that can trigger a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push {
        branch: String,
        paths_changed: Vec<String>,
        sha: Option<String>,
    },
    PullRequest {
        number: Option<u64>,
        source_branch: String,
        target_branch: String,
        paths_changed: Vec<String>,
        sha: Option<String>,
    },
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>, paths_changed: Vec<String>) -> Self {
        TriggerEvent::Push {
            branch: branch.into(),
            paths_changed,
            sha: None,
        }
    }

    pub fn pull_request(
        source_branch: impl Into<String>,
        target_branch: impl Into<String>,
        paths_changed: Vec<String>,
    ) -> Self {
        TriggerEvent::PullRequest {
            number: None,
            source_branch: source_branch.into(),
            target_branch: target_branch.into(),
            paths_changed,
            sha: None,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::PullRequest { .. } => TriggerType::PullRequest,
        }
    }

    /// Fully qualified ref the event applies to.
    pub fn git_ref(&self) -> String {
        match self {
            TriggerEvent::Push { branch, .. } => format!("refs/heads/{}", branch),
            TriggerEvent::PullRequest {
                number: Some(number),
                ..
            } => format!("refs/pull/{}/merge", number),
            TriggerEvent::PullRequest { source_branch, .. } => {
                format!("refs/heads/{}", source_branch)
            }
        }
    }

    /// Short branch name: the pushed branch, or the pull request's head.
    pub fn ref_name(&self) -> &str {
        match self {
            TriggerEvent::Push { branch, .. } => branch,
            TriggerEvent::PullRequest { source_branch, .. } => source_branch,
        }
    }

    /// Branch that branch filters apply to.
    pub fn filter_branch(&self) -> &str {
        match self {
            TriggerEvent::Push { branch, .. } => branch,
            TriggerEvent::PullRequest { target_branch, .. } => target_branch,
        }
    }

    pub fn paths_changed(&self) -> &[String] {
        match self {
            TriggerEvent::Push { paths_changed, .. }
            | TriggerEvent::PullRequest { paths_changed, .. } => paths_changed,
        }
    }

    pub fn sha(&self) -> Option<&str> {
        match self {
            TriggerEvent::Push { sha, .. } | TriggerEvent::PullRequest { sha, .. } => {
                sha.as_deref()
            }
        }
    }

    pub fn with_sha(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            TriggerEvent::Push { sha, .. } | TriggerEvent::PullRequest { sha, .. } => {
                *sha = Some(value.into());
            }
        }
        self
    }
}

/// Matcher for determining if a workflow should be triggered.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a workflow should be triggered by an event.
    pub fn matches(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> bool {
        if workflow.triggers.is_empty() {
            // Default: trigger on push to any branch
            return matches!(event, TriggerEvent::Push { .. });
        }

        workflow
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        if trigger.trigger_type != event.trigger_type() {
            return false;
        }
        self.branch_matches(&trigger.branches, &trigger.branches_ignore, event.filter_branch())
            && self.paths_match(&trigger.paths, &trigger.paths_ignore, event.paths_changed())
    }

    fn branch_matches(&self, include: &[String], exclude: &[String], branch: &str) -> bool {
        let included = include.is_empty() || build_glob_set(include).is_match(branch);
        let excluded = !exclude.is_empty() && build_glob_set(exclude).is_match(branch);
        included && !excluded
    }

    fn paths_match(&self, include: &[String], exclude: &[String], changed: &[String]) -> bool {
        if include.is_empty() && exclude.is_empty() {
            return true; // No path filtering
        }
        if changed.is_empty() {
            // Nothing is known to have changed, so nothing relevant changed.
            return false;
        }

        let included = if include.is_empty() {
            true
        } else {
            let set = build_glob_set(include);
            changed.iter().any(|path| set.is_match(path))
        };

        let excluded = if exclude.is_empty() {
            false
        } else {
            let set = build_glob_set(exclude);
            changed.iter().all(|path| set.is_match(path))
        };

        included && !excluded
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a GlobSet from pattern strings; `*` stays within one path segment.
///
/// Invalid patterns are skipped (validation reports them up front).
fn build_glob_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Ignoring invalid glob"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build glob set");
        GlobSet::empty()
    })
}
