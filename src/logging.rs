use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{EngineError, Result};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a
/// subscriber was already installed, in which case nothing changes.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let ansi = use_ansi(&config.style)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Logging initialized (level {}, style {})", config.level, config.style);
    }
    Ok(installed)
}

fn use_ansi(style: &str) -> Result<bool> {
    match style.to_lowercase().as_str() {
        "auto" => Ok(std::io::stdout().is_terminal()),
        "always" => Ok(true),
        "never" => Ok(false),
        other => Err(EngineError::Config(format!(
            "Unsupported log style '{}' (expected auto, always or never)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(level: &str, style: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            style: style.to_string(),
        }
    }

    #[test]
    fn test_style_parsing() {
        assert!(use_ansi("always").unwrap());
        assert!(!use_ansi("NEVER").unwrap());
        assert!(use_ansi("auto").is_ok());
        assert!(matches!(use_ansi("rainbow"), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_second_init_is_noop() {
        let config = logging("debug", "never");
        // The first call may lose to another test's subscriber
        init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }

    #[test]
    fn test_bad_style_is_config_error() {
        assert!(init_logging(&logging("info", "sometimes")).is_err());
    }
}
