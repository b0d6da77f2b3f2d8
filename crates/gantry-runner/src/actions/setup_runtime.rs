use super::{Action, ActionInput, ActionOutput, log};
use crate::runner::OutputLine;
use async_trait::async_trait;
use gantry_core::Result;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Resolves an interpreter of the requested version from `PATH` and puts it
/// first on `PATH` for the rest of the run.
pub struct SetupRuntimeAction;

impl Default for SetupRuntimeAction {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupRuntimeAction {
    pub fn new() -> Self {
        Self
    }

    fn search_path(input: &ActionInput) -> Option<std::ffi::OsString> {
        input
            .env
            .get("PATH")
            .map(Into::into)
            .or_else(|| std::env::var_os("PATH"))
    }

    fn resolve(input: &ActionInput, runtime: &str, version: Option<&str>) -> Option<PathBuf> {
        let search = Self::search_path(input);
        let cwd = input.workspace.clone();
        let find = |name: &str| which::which_in(name, search.clone(), &cwd).ok();

        match version {
            Some(version) => find(&format!("{}{}", runtime, version)).or_else(|| find(runtime)),
            None => find(runtime),
        }
    }

    async fn reported_version(binary: &Path) -> Option<String> {
        let output = Command::new(binary).arg("--version").output().await.ok()?;
        // Some interpreters print their version on stderr.
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Some(String::from_utf8_lossy(&text).trim().to_string())
    }
}

/// Whether `reported` (e.g. `Python 3.10.12`) satisfies `wanted` (e.g. `3.10`).
fn version_matches(reported: &str, wanted: &str) -> bool {
    reported.split_whitespace().any(|token| {
        let token = token.trim_start_matches('v');
        token == wanted || token.starts_with(&format!("{}.", wanted))
    })
}

#[async_trait]
impl Action for SetupRuntimeAction {
    fn name(&self) -> &str {
        "setup-runtime"
    }

    async fn execute(
        &self,
        input: &ActionInput,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ActionOutput> {
        let Some(runtime) = input.param("runtime") else {
            return Ok(ActionOutput::failure("setup-runtime needs a 'runtime' input"));
        };
        let version = input.param("version").filter(|v| !v.is_empty());

        let Some(binary) = Self::resolve(input, &runtime, version.as_deref()) else {
            return Ok(ActionOutput::failure(format!(
                "{} {} is not installed",
                runtime,
                version.as_deref().unwrap_or("")
            )));
        };
        debug!(binary = %binary.display(), "Resolved runtime binary");

        let reported = Self::reported_version(&binary).await.unwrap_or_default();
        if let Some(wanted) = &version
            && !version_matches(&reported, wanted)
        {
            return Ok(ActionOutput::failure(format!(
                "{} reports '{}', expected version {}",
                binary.display(),
                reported,
                wanted
            )));
        }

        let shim_dir = input
            .workspace
            .join(".gantry")
            .join("runtimes")
            .join(format!("{}-{}", runtime, version.as_deref().unwrap_or("default")))
            .join("bin");
        tokio::fs::create_dir_all(&shim_dir).await?;
        let bin_dir = link_shim(&shim_dir, &runtime, &binary).await?;

        let mut paths = vec![bin_dir];
        if let Some(existing) = Self::search_path(input) {
            paths.extend(std::env::split_paths(&existing));
        }
        let joined = std::env::join_paths(paths)
            .map_err(|e| gantry_core::Error::Internal(format!("Invalid PATH entry: {}", e)))?;

        info!(runtime = %runtime, binary = %binary.display(), version = %reported, "Runtime ready");
        log(&output_tx, format!("Using {} ({})", binary.display(), reported)).await;

        Ok(ActionOutput::success()
            .with_output("path", binary.display().to_string())
            .with_output("version", reported)
            .with_env("PATH", joined.to_string_lossy().to_string()))
    }
}

/// Make `runtime` resolve to `binary` from a directory that goes first on `PATH`.
#[cfg(unix)]
async fn link_shim(shim_dir: &Path, runtime: &str, binary: &Path) -> Result<PathBuf> {
    let link = shim_dir.join(runtime);
    if tokio::fs::symlink_metadata(&link).await.is_ok() {
        tokio::fs::remove_file(&link).await?;
    }
    tokio::fs::symlink(binary, &link).await?;
    Ok(shim_dir.to_path_buf())
}

#[cfg(not(unix))]
async fn link_shim(_shim_dir: &Path, _runtime: &str, binary: &Path) -> Result<PathBuf> {
    Ok(binary
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn input(workspace: &Path, params: serde_json::Value) -> ActionInput {
        ActionInput {
            params: serde_json::from_value(params).unwrap(),
            env: HashMap::new(),
            workspace: workspace.to_path_buf(),
            step_name: "setup".to_string(),
        }
    }

    #[test]
    fn test_version_matches() {
        assert!(version_matches("Python 3.10.12", "3.10"));
        assert!(version_matches("v18.19.0", "18"));
        assert!(version_matches("git version 2.43.0", "2.43.0"));
        assert!(!version_matches("Python 3.9.18", "3.10"));
        assert!(!version_matches("Python 3.100.1", "3.10"));
    }

    #[tokio::test]
    async fn test_missing_runtime_input() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(10);
        let out = SetupRuntimeAction::new()
            .execute(&input(dir.path(), serde_json::json!({})), tx)
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_uninstalled_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(10);
        let params = serde_json::json!({"runtime": "no-such-interpreter", "version": "9.9"});
        let out = SetupRuntimeAction::new()
            .execute(&input(dir.path(), params), tx)
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("not installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_runtime_and_prepends_shim() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(10);
        let params = serde_json::json!({"runtime": "sh"});
        let out = SetupRuntimeAction::new()
            .execute(&input(dir.path(), params), tx)
            .await
            .unwrap();
        assert!(out.success, "{:?}", out.error);

        let path = &out.env["PATH"];
        let first = std::env::split_paths(path).next().unwrap();
        assert!(first.ends_with("runtimes/sh-default/bin"));
        assert!(first.join("sh").exists());
    }
}
