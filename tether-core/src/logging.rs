//! Tracing subscriber setup.
//!
//! Every component logs through `tracing`. Applications that do not install
//! their own subscriber can call [`init`], which honors:
//!
//! - `RUST_LOG` - full filter directive, takes precedence
//! - `TETHER_LOG_LEVEL=trace|debug|info|warn|error` - minimum level
//! - `TETHER_DEBUG=1` - shorthand for `debug`
//! - `TETHER_LOG_FORMAT=json|pretty|compact` - output format

use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Logging settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive handed to `EnvFilter`.
    pub directive: String,
    /// Output format.
    pub format: Format,
}

impl LogConfig {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup("TETHER_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let directive = lookup("RUST_LOG")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| lookup("TETHER_LOG_LEVEL").map(|v| v.trim().to_ascii_lowercase()))
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let format = lookup("TETHER_LOG_FORMAT")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Self { directive, format }
    }
}

/// Install a global subscriber configured from the environment.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with(LogConfig::from_env())
}

/// Install a global subscriber with explicit settings.
pub fn init_with(config: LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match config.format {
        Format::Json => fmt::layer().json().boxed(),
        Format::Pretty => fmt::layer().pretty().boxed(),
        Format::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_to_info_compact() {
        assert_eq!(
            resolve(&[]),
            LogConfig {
                directive: "info".into(),
                format: Format::Compact
            }
        );
    }

    #[test]
    fn test_precedence() {
        assert_eq!(resolve(&[("TETHER_DEBUG", "1")]).directive, "debug");
        assert_eq!(
            resolve(&[("TETHER_DEBUG", "1"), ("TETHER_LOG_LEVEL", "WARN")]).directive,
            "warn"
        );
        assert_eq!(
            resolve(&[("TETHER_LOG_LEVEL", "warn"), ("RUST_LOG", "tether_core=trace")]).directive,
            "tether_core=trace"
        );
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(resolve(&[("TETHER_LOG_FORMAT", "json")]).format, Format::Json);
        assert_eq!(resolve(&[("TETHER_LOG_FORMAT", "Pretty")]).format, Format::Pretty);
        assert_eq!(resolve(&[("TETHER_LOG_FORMAT", "xml")]).format, Format::Compact);
    }

    #[test]
    fn test_init_only_once() {
        // Whichever call wins, a global subscriber is in place afterwards.
        let _ = init_with(LogConfig::from_lookup(|_| None));
        assert!(!init_with(LogConfig::from_lookup(|_| None)));
        assert!(!init());
    }
}
