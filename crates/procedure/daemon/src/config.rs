//! Configuration for the procedure daemon

use procedure_engine::{AuthConfig, TimerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Timer manager configuration
    #[serde(default)]
    pub timers: TimerConfig,

    /// Trusted issuers and the role mapping table
    #[serde(default)]
    pub auth: AuthConfig,

    /// Which procedure definitions to register
    #[serde(default)]
    pub procedures: ProceduresConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Procedure definition sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduresConfig {
    /// Register provider federation and community onboarding
    #[serde(default = "default_true")]
    pub builtin: bool,

    /// Directory of extra JSON definitions
    #[serde(default)]
    pub definition_dir: Option<PathBuf>,
}

impl Default for ProceduresConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            definition_dir: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `FEDMGR__`-prefixed environment variables (`FEDMGR__TIMERS__BATCH_SIZE`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // Nested keys contain underscores, so sections split on a double one
        builder = builder.add_source(
            config::Environment::with_prefix("FEDMGR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
