//! Runtime Configuration
//!
//! Configuration for the host scheduler, the reference machine, and logging.
//! Values can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `RIPPLE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RIPPLE_TICK_BUDGET` | Ready runs processed per scheduler tick | 16 |
//! | `RIPPLE_MAX_RUNS` | Maximum live runs in one scheduler (0 = unlimited) | 0 |
//! | `RIPPLE_MAX_STACK_DEPTH` | Maximum frames on a machine stack | 4096 |
//! | `RIPPLE_STEP_LIMIT` | Maximum instructions per run (0 = unlimited) | 0 |
//! | `RIPPLE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//!
//! let config = RuntimeConfig::builder()
//!     .tick_budget(4)
//!     .max_stack_depth(1024)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::vm::MachineConfig;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Host scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Ready runs advanced per tick.
    /// Default: 16.
    pub tick_budget: usize,

    /// Maximum number of live runs; 0 means unlimited.
    /// Default: 0.
    pub max_runs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_budget: 16,
            max_runs: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: only in debug builds.
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub machine: MachineConfig,
    pub log: LogConfig,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("RIPPLE_TICK_BUDGET") {
            if val > 0 {
                config.scheduler.tick_budget = val;
            }
        }

        if let Some(val) = parse_env_usize("RIPPLE_MAX_RUNS") {
            config.scheduler.max_runs = val;
        }

        if let Some(val) = parse_env_usize("RIPPLE_MAX_STACK_DEPTH") {
            if val >= 16 {
                config.machine.max_stack_depth = val;
            }
        }

        if let Some(val) = parse_env_usize("RIPPLE_STEP_LIMIT") {
            config.machine.step_limit = if val > 0 { Some(val as u64) } else { None };
        }

        if let Ok(val) = env::var("RIPPLE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_budget == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.tick_budget".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.machine.max_stack_depth < 16 {
            return Err(ConfigError::InvalidValue {
                field: "machine.max_stack_depth".into(),
                message: "must be at least 16 frames".into(),
            });
        }

        if self.machine.step_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "machine.step_limit".into(),
                message: "use None for an unlimited run".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError { var: String, message: String },
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_budget(mut self, budget: usize) -> Self {
        self.config.scheduler.tick_budget = budget;
        self
    }

    pub fn max_runs(mut self, max: usize) -> Self {
        self.config.scheduler.max_runs = max;
        self
    }

    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.config.machine.max_stack_depth = depth;
        self
    }

    pub fn step_limit(mut self, limit: Option<u64>) -> Self {
        self.config.machine.step_limit = limit;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
