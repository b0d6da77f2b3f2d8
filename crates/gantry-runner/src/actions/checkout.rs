use super::{Action, ActionInput, ActionOutput, log};
use crate::runner::OutputLine;
use crate::shell::stream_command;
use async_trait::async_trait;
use gantry_core::Result;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;

pub struct CheckoutAction;

impl Default for CheckoutAction {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckoutAction {
    pub fn new() -> Self {
        Self
    }

    fn git(input: &ActionInput, dir: &std::path::Path, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(dir).envs(&input.env);
        cmd
    }
}

#[async_trait]
impl Action for CheckoutAction {
    fn name(&self) -> &str {
        "checkout"
    }

    async fn execute(
        &self,
        input: &ActionInput,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ActionOutput> {
        let Some(repo) = input.param_or_env("repository", "GANTRY_REPOSITORY") else {
            return Ok(ActionOutput::failure(
                "checkout needs a 'repository' input or GANTRY_REPOSITORY",
            ));
        };
        let ref_name = input
            .param_or_env("ref", "GANTRY_SHA")
            .or_else(|| input.env.get("GANTRY_REF").cloned())
            .filter(|r| !r.is_empty());
        let path = input.param("path").unwrap_or_else(|| ".".to_string());
        let target = input.workspace.join(&path);

        info!(repository = %repo, git_ref = ?ref_name, path = %path, "Checking out repository");
        log(&output_tx, format!("Cloning {} into {}", repo, target.display())).await;

        tokio::fs::create_dir_all(&target).await?;

        let clone = Self::git(input, &target, &["clone", "--quiet", &repo, "."]);
        let code = stream_command(clone, output_tx.clone()).await?;
        if code != 0 {
            return Ok(ActionOutput::failure_with_code("git clone failed", code));
        }

        if let Some(ref_name) = &ref_name {
            // Branch refs resolve through the remote-tracking name after a clone.
            let rev = match ref_name.strip_prefix("refs/heads/") {
                Some(branch) => format!("origin/{}", branch),
                None => ref_name.clone(),
            };
            let fetch = Self::git(input, &target, &["fetch", "--quiet", "origin", ref_name]);
            let _ = stream_command(fetch, output_tx.clone()).await?;

            let checkout = Self::git(input, &target, &["checkout", "--quiet", "--detach", &rev]);
            let code = stream_command(checkout, output_tx.clone()).await?;
            if code != 0 {
                return Ok(ActionOutput::failure_with_code(
                    format!("git checkout {} failed", rev),
                    code,
                ));
            }
        }

        let sha = Self::git(input, &target, &["rev-parse", "HEAD"])
            .output()
            .await
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        log(&output_tx, format!("Checked out {}", sha)).await;
        Ok(ActionOutput::success()
            .with_output("sha", sha)
            .with_output("path", target.display().to_string()))
    }
}
