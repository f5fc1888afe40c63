//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over `[logging] level` when set. Logs go to stderr so
//! that `dgx query --json` output on stdout stays parseable.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);
        if config.format == "json" {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        } else {
            registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
    });
}
