use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding one working tree per room. Defaults to
    /// `~/.foreman/workspaces`.
    pub root: Option<String>,
    pub default_branch: String,
    pub author_name: String,
    pub author_email: String,
    pub git_timeout_secs: u64,
    /// Uncommitted file count above which a large-delta signal fires.
    pub large_delta_threshold: usize,
    /// Minimum time between remote fetches during sweeps.
    pub fetch_interval_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            default_branch: "main".to_string(),
            author_name: "Foreman".to_string(),
            author_email: "foreman@localhost".to_string(),
            git_timeout_secs: 60,
            large_delta_threshold: 25,
            fetch_interval_secs: 300,
        }
    }
}

impl WorkspaceConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
    /// Events older than this are ignored by the reactor.
    pub event_window_secs: u64,
    pub stale_after_mins: i64,
    pub processed_event_cap: usize,
    pub default_cooldown_secs: u64,
    pub stale_cooldown_secs: u64,
    pub security_cooldown_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            event_window_secs: 60,
            stale_after_mins: 30,
            processed_event_cap: 5000,
            default_cooldown_secs: 60,
            stale_cooldown_secs: 180,
            security_cooldown_secs: 120,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn event_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.event_window_secs as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_mins)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }

    pub fn stale_cooldown(&self) -> Duration {
        Duration::from_secs(self.stale_cooldown_secs)
    }

    pub fn security_cooldown(&self) -> Duration {
        Duration::from_secs(self.security_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_existing_targets: usize,
    pub max_new_targets: usize,
    /// Files listed in the planning prompt.
    pub max_context_files: usize,
    /// Characters of one file sent to the patcher.
    pub file_content_cap: usize,
    /// Characters of all file contents sent to the patcher.
    pub prompt_content_budget: usize,
    pub verify_timeout_secs: u64,
    /// Characters of command output kept in block reasons and notes.
    pub output_tail_chars: usize,
    pub editable_extensions: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_existing_targets: 6,
            max_new_targets: 2,
            max_context_files: 400,
            file_content_cap: 12_000,
            prompt_content_budget: 60_000,
            verify_timeout_secs: 180,
            output_tail_chars: 4_000,
            editable_extensions: [
                "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "md", "css", "scss",
                "html", "py", "go", "java", "kt", "rb", "sql", "yaml", "yml", "toml", "txt",
                "sh", "graphql", "proto", "vue", "svelte",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ExecutionConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Headless completion CLI, resolved on PATH.
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            timeout_secs: 300,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("state.json"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace.root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("workspaces")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        debug!(
            sweep_secs = config.monitor.sweep_interval_secs,
            completion = %config.completion.command,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        let workspaces = self.workspaces_dir()?;
        for d in [dir, workspaces] {
            if !d.exists() {
                debug!(dir = %d.display(), "Creating directory");
                fs::create_dir_all(&d)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
