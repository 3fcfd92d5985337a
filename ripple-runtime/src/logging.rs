//! Logging setup.
//!
//! The runtime and compiler log through `tracing`. Hosts that want the
//! output on stderr call [`init`] once; `RUST_LOG` overrides the configured
//! level when set.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Install a global `fmt` subscriber for `config`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(config.level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_writer(std::io::stderr);
    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
    result.is_ok()
}

/// Filter directive for a configured level.
pub fn directive(level: LogLevel) -> &'static str {
    level.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_matches_level_names() {
        assert_eq!(directive(LogLevel::Off), "off");
        assert_eq!(directive(LogLevel::Debug), "debug");
    }

    #[test]
    fn test_init_twice_reports_existing_subscriber() {
        let config = LogConfig { level: LogLevel::Warn, timestamps: false, source_location: false };
        let _ = init(&config);
        assert!(!init(&config));
    }
}
