use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::RelayError;
use crate::model::AgentType;

const DEFAULT_CONFIG_PATH: &str = "agentrelay.toml";
const CONFIG_PATH_ENV: &str = "AGENTRELAY_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub coordinator: CoordinatorConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `AGENTRELAY_CONFIG` environment variable.
    /// 3. `agentrelay.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<RelayConfig, RelayError> {
        let candidate = resolve_path(path);
        Self::load_file(&candidate)
    }

    /// Like [`ConfigLoader::load`], but falls back to defaults when the
    /// resolved file does not exist.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<RelayConfig, RelayError> {
        let candidate = resolve_path(path);
        if !candidate.exists() {
            return Ok(RelayConfig::default());
        }
        Self::load_file(&candidate)
    }

    pub fn from_toml(raw: &str) -> Result<RelayConfig, RelayError> {
        let config: RelayConfig =
            toml::from_str(raw).map_err(|err| RelayError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<RelayConfig, RelayError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RelayError::config_io(path.to_path_buf(), err))?;
        Self::from_toml(&raw)
    }

    fn validate(config: &RelayConfig) -> Result<(), RelayError> {
        let coordinator = &config.coordinator;
        if coordinator.max_attempts == 0 {
            return Err(RelayError::InvalidConfiguration(
                "coordinator.max_attempts must be at least 1".into(),
            ));
        }
        if coordinator.worker_timeout_ms == 0 {
            return Err(RelayError::InvalidConfiguration(
                "coordinator.worker_timeout_ms must be positive".into(),
            ));
        }
        if coordinator.initial_backoff_ms > coordinator.max_backoff_ms {
            return Err(RelayError::InvalidConfiguration(format!(
                "coordinator.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                coordinator.initial_backoff_ms, coordinator.max_backoff_ms
            )));
        }
        if coordinator.max_concurrent_research == 0 {
            return Err(RelayError::InvalidConfiguration(
                "coordinator.max_concurrent_research must be at least 1".into(),
            ));
        }
        if coordinator.research_domains.is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "coordinator.research_domains must name at least one domain".into(),
            ));
        }
        if let Some(domain) = coordinator
            .research_domains
            .iter()
            .find(|domain| !domain.is_research())
        {
            return Err(RelayError::InvalidConfiguration(format!(
                "coordinator.research_domains contains non-research agent `{domain}`"
            )));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

/// Retry, timeout and fan-out policy of the workflow coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts per task, including the first one
    pub max_attempts: u32,
    /// Per-invocation timeout in milliseconds
    pub worker_timeout_ms: u64,
    /// Initial backoff between attempts in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff between attempts in milliseconds
    pub max_backoff_ms: u64,
    /// Research tasks allowed in flight at once
    pub max_concurrent_research: usize,
    /// Research domains queried for every sub-query
    pub research_domains: Vec<AgentType>,
    /// Source cap handed to each research task
    pub max_sources_per_task: usize,
    /// Upper bound on sub-queries requested from decomposition
    pub max_sub_queries: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            worker_timeout_ms: 60_000,
            initial_backoff_ms: 0,
            max_backoff_ms: 5_000,
            max_concurrent_research: 4,
            research_domains: vec![AgentType::WebResearch, AgentType::SocialResearch],
            max_sources_per_task: 5,
            max_sub_queries: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deepest context forwarded to the outward consumer; unlimited if unset.
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}
