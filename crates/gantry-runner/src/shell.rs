//! Shell-based step execution on the host.

use crate::runner::{OutputLine, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::workflow::StepDefinition;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// File a step writes `key=value` outputs to.
pub const OUTPUT_FILE_VAR: &str = "GANTRY_OUTPUT";
/// File a step writes `KEY=value` lines to, exported to later steps.
pub const ENV_FILE_VAR: &str = "GANTRY_ENV";

/// Shell runner for executing commands on the host.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    async fn execute_command(
        &self,
        script: &str,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let work_dir = match &ctx.step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };

        let files_dir = ctx.files_dir();
        tokio::fs::create_dir_all(&files_dir).await?;
        let stem = sanitize(&ctx.step.name);
        let output_file = files_dir.join(format!("{}.output", stem));
        let env_file = files_dir.join(format!("{}.env", stem));
        // A killed step never reaches read_key_values, so its files may still be here.
        remove_stale(&output_file).await?;
        remove_stale(&env_file).await?;

        info!(
            step = %ctx.step.name,
            shell = %ctx.step.shell,
            work_dir = %work_dir.display(),
            "Executing shell command"
        );

        let mut cmd = Command::new(&ctx.step.shell);
        cmd.args(shell_args(&ctx.step.shell))
            .arg(script)
            .current_dir(&work_dir)
            .envs(&ctx.env)
            .envs(&ctx.step.env)
            .env(OUTPUT_FILE_VAR, &output_file)
            .env(ENV_FILE_VAR, &env_file);

        let exit_code = stream_command(cmd, output_tx).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(exit_code, duration_ms, "Command completed");

        let mut result = StepResult::from_exit_code(exit_code, duration_ms);
        result.outputs = read_key_values(&output_file).await;
        result.env = read_key_values(&env_file).await;
        Ok(result)
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let script = ctx
            .step
            .run
            .as_ref()
            .ok_or_else(|| gantry_core::Error::Internal("No command to run".to_string()))?;

        self.execute_command(script, ctx, output_tx).await
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.run.is_some() && step.uses.is_none()
    }
}

/// Arguments placed before the script for a given shell.
///
/// bash and sh run with errexit so a multi-line script stops at the first failing command.
fn shell_args(shell: &str) -> &'static [&'static str] {
    let program = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);
    match program {
        "bash" => &["--noprofile", "--norc", "-eo", "pipefail", "-c"],
        "sh" | "dash" | "zsh" => &["-e", "-c"],
        "pwsh" | "powershell" => &["-NoProfile", "-NonInteractive", "-Command"],
        "cmd" => &["/D", "/C"],
        _ => &["-c"],
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Spawn a command, forward its stdout/stderr line by line, and wait for its exit code.
///
/// The child is killed if the returned future is dropped before it exits.
pub async fn stream_command(mut cmd: Command, output_tx: mpsc::Sender<OutputLine>) -> Result<i32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| gantry_core::Error::Spawn(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| gantry_core::Error::Internal("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| gantry_core::Error::Internal("stderr not captured".to_string()))?;

    let stdout_handle = tokio::spawn(forward_lines(stdout, output_tx.clone(), |line, n| {
        OutputLine::stdout(line, n)
    }));
    let stderr_handle = tokio::spawn(forward_lines(stderr, output_tx, |line, n| {
        OutputLine::stderr(line, n)
    }));

    let status = child.wait().await?;

    let _ = stdout_handle.await;
    let _ = stderr_handle.await;

    Ok(status.code().unwrap_or(-1))
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::Sender<OutputLine>,
    make: fn(String, u32) -> OutputLine,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_num = 0u32;
    while let Ok(Some(line)) = lines.next_line().await {
        line_num += 1;
        if tx.send(make(line, line_num)).await.is_err() {
            break;
        }
    }
}

async fn remove_stale(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn read_key_values(path: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        for line in content.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    values.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        let _ = tokio::fs::remove_file(path).await;
    }
    values
}
