//! Worker configuration, loaded from a YAML file by the CLI and handed to
//! the dispatch loop as a settled record.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds between empty-poll retries against the queue.
    pub interval: u64,
    /// Per-container wall-clock budget in seconds.
    pub timeout: u64,
    /// Optional bound on handled jobs; unlimited when absent.
    #[serde(default)]
    pub num: Option<u64>,
    /// Remove containers after they exit.
    pub rm: bool,
    pub evaluator_queue_url: String,
    pub scorer_queue_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region_name: String,
    pub table_name: String,
    pub log_level: LogLevel,
    /// Overwrite a leftover stop-flag file at startup.
    #[serde(default)]
    pub force: bool,
    /// GraphQL endpoint resolving match ids to their artifacts.
    pub api_url: url::Url,
    /// Bearer token for the endpoint, when it requires one.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The default `EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.interval >= 1, "interval must be at least 1 second");
        Ok(())
    }
}
