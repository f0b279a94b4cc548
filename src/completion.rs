//! Structured completion requests.
//!
//! The pipeline and impact analyzer ask a completion service for JSON
//! objects (plans, patches, impact summaries). [`HeadlessCompletion`]
//! drives a headless CLI in `-p` mode with JSON output and pulls the first
//! JSON object out of the result text.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CompletionConfig;
use crate::error::{Error, Result};
use crate::workspace::{CommandRunner, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPurpose {
    Plan,
    Patch,
    ImpactSummary,
}

impl CompletionPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionPurpose::Plan => "plan",
            CompletionPurpose::Patch => "patch",
            CompletionPurpose::ImpactSummary => "impact_summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    /// Role and output schema instructions.
    pub system: String,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(
        purpose: CompletionPurpose,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            purpose,
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Return a JSON object answering `request`, or fail.
    async fn complete(&self, request: &CompletionRequest) -> Result<Value>;
}

/// Envelope printed by the headless CLI with `--output-format json`.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct HeadlessCompletion {
    binary: PathBuf,
    timeout: Duration,
    cwd: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl HeadlessCompletion {
    /// Resolve the configured command on `PATH`.
    pub fn new(config: &CompletionConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let binary = which::which(&config.command)
            .map_err(|_| Error::Completion(format!("{} not found on PATH", config.command)))?;
        Ok(Self::with_binary(binary, runner).with_timeout(config.timeout()))
    }

    pub fn with_binary(binary: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(CompletionConfig::default().timeout_secs),
            cwd: std::env::temp_dir(),
            runner,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory the CLI runs in. Defaults to the system temp dir so the
    /// CLI does not pick up a project context.
    pub fn with_cwd(mut self, cwd: &Path) -> Self {
        self.cwd = cwd.to_path_buf();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Parse the CLI envelope and return the result text.
    fn parse_envelope(stdout: &str) -> Result<String> {
        let raw: RawResponse = serde_json::from_str(stdout.trim())?;
        let failed = raw.is_error || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "completion failed".to_string());
            return Err(Error::Completion(message));
        }
        raw.result
            .ok_or_else(|| Error::Completion("response has no result".to_string()))
    }
}

#[async_trait]
impl CompletionService for HeadlessCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value> {
        let prompt = format!(
            "{}\n\n{}\n\nRespond with a single JSON object and nothing else.",
            request.system, request.prompt
        );
        debug!(
            purpose = request.purpose.as_str(),
            prompt_chars = prompt.len(),
            "completion request"
        );

        let spec = CommandSpec::new(
            &self.cwd,
            [
                self.binary.to_string_lossy().into_owned(),
                "-p".to_string(),
                prompt,
                "--output-format".to_string(),
                "json".to_string(),
            ],
            self.timeout,
        );
        let output = self.runner.run(&spec).await?;
        if output.timed_out {
            return Err(Error::Timeout(self.timeout));
        }

        let text = match Self::parse_envelope(&output.stdout) {
            Ok(text) => text,
            Err(e) if !output.success() => {
                warn!(purpose = request.purpose.as_str(), error = %e, "completion command failed");
                let stderr = output.stderr.trim();
                return Err(Error::Completion(if stderr.is_empty() {
                    output.describe_failure()
                } else {
                    stderr.to_string()
                }));
            }
            Err(Error::Json(_)) => output.stdout,
            Err(e) => return Err(e),
        };

        extract_json_object(&text).ok_or_else(|| {
            Error::Completion(format!(
                "no JSON object in {} response",
                request.purpose.as_str()
            ))
        })
    }
}

/// First JSON object in `text`: the whole text, a fenced block, or an
/// object embedded in prose.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    for (start, _) in trimmed.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            return Some(value);
        }
    }
    None
}
