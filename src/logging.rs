//! Tracing subscriber setup for the binary and the hardware harness.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::HarnessEnv;
use crate::error::Result;

/// Filter used when neither the caller nor `RUST_LOG` provides one.
pub const DEFAULT_FILTER: &str = "info";

/// Where and how much to log.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// `EnvFilter` directives; falls back to `RUST_LOG`, then [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

impl From<&HarnessEnv> for LogConfig {
    fn from(env: &HarnessEnv) -> Self {
        Self {
            filter: Some(env.logging_config.clone()),
            file: Some(env.log_buffer.clone()),
        }
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|err| crate::AcquireError::Config(format!("invalid log filter: {err}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Mutex::new(file))
                .with_filter(filter)
                .boxed()
        }
        None => fmt::layer()
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    // Already initialised is fine; keep the first subscriber.
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig {
            filter: Some("cam_acquire=notalevel".to_owned()),
            file: None,
        };
        assert!(init(&config).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
