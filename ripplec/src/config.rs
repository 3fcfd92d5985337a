//! Compiler Configuration
//!
//! Backend selection and artifact options. Configuration can be built in
//! code, loaded from environment variables, or read from the `[backend]`
//! table of a TOML file.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RIPPLE_BACKEND` | `trampoline` or `stack-switching` | trampoline |
//! | `RIPPLE_BACKEND_FALLBACK` | Fall back to the trampoline backend when stack switching cannot be used | true |
//! | `RIPPLE_TARGET_STACK_SWITCHING` | Whether the target supports stack switching | false |
//! | `RIPPLE_EMIT_EFFECT_TABLE` | Emit the effect table section | true |
//!
//! # TOML
//!
//! ```toml
//! [backend]
//! kind = "stack-switching"
//! fallback = true
//!
//! [target]
//! stack_switching = true
//!
//! [artifact]
//! emit_effect_table = true
//! ```

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code generation strategy for effectful functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Closure trampolines returning tagged outcomes.
    #[default]
    Trampoline,
    /// Native suspend/resume on fibers.
    StackSwitching,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trampoline" | "cps" => Some(BackendKind::Trampoline),
            "stack-switching" | "stack_switching" | "fibers" => Some(BackendKind::StackSwitching),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Trampoline => "trampoline",
            BackendKind::StackSwitching => "stack-switching",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Requested backend.
    pub kind: BackendKind,
    /// Whether to fall back to the trampoline backend, for the whole module,
    /// when the requested stack-switching backend cannot be used.
    pub fallback: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Trampoline,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Whether the target machine provides native suspend/resume.
    pub stack_switching: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub emit_effect_table: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self { emit_effect_table: true }
    }
}

/// Complete compiler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub backend: BackendConfig,
    pub target: TargetConfig,
    pub artifact: ArtifactConfig,
}

impl CompilerConfig {
    pub fn builder() -> CompilerConfigBuilder {
        CompilerConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("RIPPLE_BACKEND") {
            if let Some(kind) = BackendKind::parse(&val) {
                config.backend.kind = kind;
            }
        }

        if let Some(val) = parse_env_bool("RIPPLE_BACKEND_FALLBACK") {
            config.backend.fallback = val;
        }

        if let Some(val) = parse_env_bool("RIPPLE_TARGET_STACK_SWITCHING") {
            config.target.stack_switching = val;
        }

        if let Some(val) = parse_env_bool("RIPPLE_EMIT_EFFECT_TABLE") {
            config.artifact.emit_effect_table = val;
        }

        config
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Whether the stack-switching backend may be selected at all.
    /// Otherwise a stack-switching request either falls back or is
    /// reported as unavailable by the compiler.
    pub fn stack_switching_available(&self) -> bool {
        self.target.stack_switching
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration file: {0}")]
    Toml(String),
}

/// Builder for [`CompilerConfig`].
#[derive(Debug, Clone, Default)]
pub struct CompilerConfigBuilder {
    config: CompilerConfig,
}

impl CompilerConfigBuilder {
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend.kind = kind;
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.config.backend.fallback = enabled;
        self
    }

    pub fn target_stack_switching(mut self, supported: bool) -> Self {
        self.config.target.stack_switching = supported;
        self
    }

    pub fn emit_effect_table(mut self, enabled: bool) -> Self {
        self.config.artifact.emit_effect_table = enabled;
        self
    }

    /// Every combination is accepted; one the target cannot honor is
    /// reported by [`compile`](crate::compile) as a diagnostic.
    pub fn build(self) -> CompilerConfig {
        self.config
    }
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
