//! Tracing initialization.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Environment variable holding a `tracing` filter directive, e.g.
/// `SQUEEZE_LOG=context_squeeze=debug,sqlx=warn`.
pub const LOG_ENV: &str = "SQUEEZE_LOG";

/// Install a global fmt subscriber writing to stderr.
///
/// `SQUEEZE_LOG` wins over `config.level`. Returns `false` when a global
/// subscriber was already installed, so calling this twice is harmless.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let config = LoggingConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
