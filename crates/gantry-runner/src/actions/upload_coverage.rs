use super::{Action, ActionInput, ActionOutput, log};
use crate::runner::OutputLine;
use async_trait::async_trait;
use gantry_core::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_REPORT: &str = "coverage.xml";

/// Uploads a coverage report file to an external reporting service.
pub struct UploadCoverageAction {
    client: reqwest::Client,
}

impl Default for UploadCoverageAction {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadCoverageAction {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Action for UploadCoverageAction {
    fn name(&self) -> &str {
        "upload-coverage"
    }

    async fn execute(
        &self,
        input: &ActionInput,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ActionOutput> {
        let Some(url) = input.param_or_env("url", "GANTRY_COVERAGE_URL") else {
            return Ok(ActionOutput::failure(
                "upload-coverage needs a 'url' input or GANTRY_COVERAGE_URL",
            ));
        };
        let file = input
            .param("file")
            .unwrap_or_else(|| DEFAULT_REPORT.to_string());
        let path = input.workspace.join(&file);

        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Coverage report unreadable");
                return Ok(ActionOutput::failure(format!(
                    "coverage report {} not readable: {}",
                    file, e
                )));
            }
        };
        let size = body.len();

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(flags) = input.param("flags") {
            query.push(("flags", flags));
        }
        if let Some(sha) = input.env.get("GANTRY_SHA") {
            query.push(("commit", sha.clone()));
        }
        if let Some(branch) = input.env.get("GANTRY_REF_NAME") {
            query.push(("branch", branch.clone()));
        }
        if let Some(name) = input.env.get("GANTRY_RUN_NAME") {
            query.push(("name", name.clone()));
        }

        let mut request = self
            .client
            .post(&url)
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        if let Some(token) = input.param_or_env("token", "GANTRY_COVERAGE_TOKEN") {
            request = request.bearer_auth(token);
        }

        log(&output_tx, format!("Uploading {} ({} bytes) to {}", file, size, url)).await;

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(ActionOutput::failure(format!("coverage upload failed: {}", e)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(ActionOutput::failure(format!(
                "coverage service answered {}: {}",
                status,
                text.trim()
            )));
        }

        info!(url = %url, bytes = size, "Coverage uploaded");
        Ok(ActionOutput::success()
            .with_output("url", url)
            .with_output("bytes", size.to_string()))
    }
}
