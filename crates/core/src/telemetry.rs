//! Tracing subscriber set-up.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a `fmt` subscriber filtered by the configured level.
///
/// An unparseable level falls back to `info`. Returns `false` when a global
/// subscriber was already installed, which is expected in tests and in
/// hosts that set up their own tracing.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            level: "not a level ===".into(),
        };
        let _ = init(&config);
        // A second install never panics.
        assert!(!init(&LoggingConfig::default()));
    }
}
