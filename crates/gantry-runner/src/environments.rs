//! Execution environment management.

use async_trait::async_trait;
use crate::runner::step_files_dir;
use gantry_core::{Result, RunId};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Trait for execution environments.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Prepare the execution environment.
    async fn prepare(&self) -> Result<()>;

    /// Get the working directory.
    fn working_dir(&self) -> &Path;

    /// Cleanup the execution environment.
    async fn cleanup(&self) -> Result<()>;
}

/// A fresh directory per run, discarded when the run ends.
pub struct ScratchEnvironment {
    workspace: PathBuf,
    keep: bool,
}

impl ScratchEnvironment {
    pub fn new(root: &Path, run_id: RunId, keep: bool) -> Self {
        Self {
            workspace: root.join(run_id.to_string()),
            keep,
        }
    }
}

#[async_trait]
impl Environment for ScratchEnvironment {
    async fn prepare(&self) -> Result<()> {
        info!(workspace = %self.workspace.display(), "Provisioning scratch workspace");
        if tokio::fs::metadata(&self.workspace).await.is_ok() {
            tokio::fs::remove_dir_all(&self.workspace).await?;
        }
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|e| {
                gantry_core::Error::Provisioning(format!(
                    "Failed to create workspace {}: {}",
                    self.workspace.display(),
                    e
                ))
            })?;
        Ok(())
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    async fn cleanup(&self) -> Result<()> {
        if self.keep {
            info!(workspace = %self.workspace.display(), "Keeping workspace");
            return Ok(());
        }
        debug!(workspace = %self.workspace.display(), "Discarding workspace");
        if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(workspace = %self.workspace.display(), error = %e, "Failed to discard workspace");
            return Err(e.into());
        }
        Ok(())
    }
}

/// An existing directory used in place.
///
/// Only the run's own step-files directory is removed at cleanup.
pub struct HostEnvironment {
    workspace: PathBuf,
    run_id: RunId,
}

impl HostEnvironment {
    pub fn new(workspace: PathBuf, run_id: RunId) -> Self {
        Self { workspace, run_id }
    }
}

#[async_trait]
impl Environment for HostEnvironment {
    async fn prepare(&self) -> Result<()> {
        info!(workspace = %self.workspace.display(), "Using host workspace in place");
        if !tokio::fs::metadata(&self.workspace)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(gantry_core::Error::Provisioning(format!(
                "{} is not a directory",
                self.workspace.display()
            )));
        }
        Ok(())
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    async fn cleanup(&self) -> Result<()> {
        let files = step_files_dir(&self.workspace, self.run_id);
        match tokio::fs::remove_dir_all(&files).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Where each run's workspace comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// A fresh directory per run under `root`.
    Scratch { root: PathBuf, keep: bool },
    /// Every run works directly in this directory.
    InPlace(PathBuf),
}

impl Default for WorkspaceMode {
    fn default() -> Self {
        WorkspaceMode::Scratch {
            root: std::env::temp_dir().join("gantry"),
            keep: false,
        }
    }
}

/// Factory for creating execution environments.
pub struct EnvironmentFactory;

impl EnvironmentFactory {
    /// Create the environment for one run.
    pub fn create(mode: &WorkspaceMode, run_id: RunId) -> Box<dyn Environment> {
        match mode {
            WorkspaceMode::Scratch { root, keep } => {
                Box::new(ScratchEnvironment::new(root, run_id, *keep))
            }
            WorkspaceMode::InPlace(dir) => Box::new(HostEnvironment::new(dir.clone(), run_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_is_fresh_and_discarded() {
        let root = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let env = ScratchEnvironment::new(root.path(), run_id, false);

        env.prepare().await.unwrap();
        let dir = env.working_dir().to_path_buf();
        assert!(dir.is_dir());
        std::fs::write(dir.join("installed.txt"), "pkg").unwrap();

        // Preparing again must not leak earlier state.
        env.prepare().await.unwrap();
        assert!(!dir.join("installed.txt").exists());

        env.cleanup().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_scratch_keep() {
        let root = tempfile::tempdir().unwrap();
        let env = ScratchEnvironment::new(root.path(), RunId::new(), true);
        env.prepare().await.unwrap();
        env.cleanup().await.unwrap();
        assert!(env.working_dir().is_dir());
    }

    #[tokio::test]
    async fn test_host_requires_existing_dir() {
        let root = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let ok = HostEnvironment::new(root.path().to_path_buf(), run_id);
        ok.prepare().await.unwrap();
        std::fs::write(root.path().join("source.py"), "print()").unwrap();
        let files = step_files_dir(root.path(), run_id);
        std::fs::create_dir_all(&files).unwrap();

        ok.cleanup().await.unwrap();
        assert!(root.path().join("source.py").exists());
        assert!(!files.exists());

        let missing = HostEnvironment::new(root.path().join("missing"), RunId::new());
        assert!(missing.prepare().await.is_err());
    }

    #[test]
    fn test_factory_uses_run_id_for_scratch() {
        let run_id = RunId::new();
        let mode = WorkspaceMode::Scratch {
            root: PathBuf::from("/tmp/gantry-test"),
            keep: false,
        };
        let env = EnvironmentFactory::create(&mode, run_id);
        assert!(env.working_dir().ends_with(run_id.to_string()));
    }
}
