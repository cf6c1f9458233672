use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::Config;

/// Overrides the config file location when set.
pub const CONFIG_ENV: &str = "STEWARD_CONFIG";

/// Credentials that may live in the environment instead of config.json.
/// A value in the file always wins.
fn credential_slots(config: &mut Config) -> [(&'static str, &mut String); 4] {
    let tools = &mut config.tools;
    [
        ("TAVILY_API_KEY", &mut tools.search.api_key),
        ("GITHUB_TOKEN", &mut tools.github.token),
        ("VERCEL_API_TOKEN", &mut tools.vercel.token),
        ("VERCEL_PROJECT_ID", &mut tools.vercel.project_id),
    ]
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Workspace directory holding the persona and utility scripts.
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// Reject settings the collector, memory and agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if !(0.0..=1.0).contains(&memory.similarity_threshold) {
            bail!(
                "memory.similarityThreshold must be between 0 and 1, got {}",
                memory.similarity_threshold
            );
        }
        if memory.embedding.dimensions == 0 {
            bail!("memory.embedding.dimensions must be positive");
        }

        let collector = &self.collector;
        if collector.max_iterations == 0 {
            bail!("collector.maxIterations must be positive");
        }
        if collector.max_duration_hours == 0 {
            bail!("collector.maxDurationHours must be positive");
        }
        if collector.lease_ttl_secs <= collector.interval_secs.max(collector.retry_interval_secs) {
            bail!(
                "collector.leaseTtlSecs ({}) must exceed intervalSecs ({}) and retryIntervalSecs ({}) \
                 or the lease lapses between iterations",
                collector.lease_ttl_secs,
                collector.interval_secs,
                collector.retry_interval_secs
            );
        }
        if collector.default_query.trim().is_empty() || collector.fallback_query.trim().is_empty() {
            bail!("collector.defaultQuery and collector.fallbackQuery must not be empty");
        }

        if self.agents.defaults.max_tool_iterations == 0 {
            bail!("agents.defaults.maxToolIterations must be positive");
        }
        if self.storage.path.trim().is_empty() {
            bail!("storage.path must not be empty");
        }
        Ok(())
    }

    /// Fill empty credentials from `env`.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        for (var, slot) in credential_slots(self) {
            if slot.is_empty() {
                if let Some(value) = env(var).filter(|v| !v.is_empty()) {
                    *slot = value;
                }
            }
        }
    }
}

/// Config file to use: `$STEWARD_CONFIG`, then `./config.json`, then
/// `~/.steward/config.json`. The last one is returned even when missing.
pub fn find_config_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(explicit);
    }
    let local = PathBuf::from("config.json");
    if local.exists() {
        return local;
    }
    expand_home("~/.steward/config.json")
}

/// Load, fill credentials from the environment and validate. A missing file
/// yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env(|var| std::env::var(var).ok());
    config
        .validate()
        .with_context(|| format!("invalid config '{}'", path.display()))?;
    Ok(config)
}

/// Write `config` as pretty JSON, creating parent directories.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create '{}'", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("failed to write config '{}'", path.display()))
}
