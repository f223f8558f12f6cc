use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::tasks::DEFAULT_CLAIM_LEASE_SECONDS;
use crate::workflows::TickOptions;

/// Host configuration for Tickwork
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TickworkConfig {
    pub engine: EngineConfig,
    pub observability: ObservabilityConfig,
    /// Only used with the `database` feature
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default transition budget per tick; unset runs each tick to a stop point
    pub max_transitions_per_tick: Option<u32>,
    /// How long a claim stays valid
    pub claim_lease_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transitions_per_tick: None,
            claim_lease_seconds: DEFAULT_CLAIM_LEASE_SECONDS as u64,
        }
    }
}

impl EngineConfig {
    pub fn tick_options(&self) -> TickOptions {
        TickOptions {
            max_transitions_per_tick: self.max_transitions_per_tick,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// EnvFilter directive, overridden by RUST_LOG
    pub log_level: String,
    /// Emit JSON lines instead of human readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite://.tickwork/tickwork.db`
    pub url: String,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.tickwork/tickwork.db".to_string(),
            max_connections: 5,
            auto_migrate: true,
        }
    }
}

impl TickworkConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (tickwork.toml, .tickwork-rc)
    /// 3. Environment variables (prefixed with TICKWORK_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) with config files looked up in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let toml_path = dir.join("tickwork.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".tickwork-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TICKWORK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let tickwork_config: TickworkConfig = config.try_deserialize()?;

        if tickwork_config.engine.max_transitions_per_tick == Some(0) {
            anyhow::bail!("engine.max_transitions_per_tick must be at least 1");
        }

        Ok(tickwork_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<TickworkConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = TickworkConfig::load_env_file();
        TickworkConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static TickworkConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
