//! Tracing subscriber setup for processes embedding an ACN node.

use acn_types::config::AcnConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `log_level`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(config: &AcnConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = AcnConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
