//! Acquisition settings and the harness environment.
//!
//! [`AcquisitionConfig`] is layered with figment: built-in defaults, then an
//! optional TOML file, then `CAM_ACQUIRE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AcquireError, Result};
use crate::pool::DEFAULT_POOL_CAPACITY;

/// Prefix of environment overrides, e.g. `CAM_ACQUIRE_POOL_CAPACITY=32`.
pub const ENV_PREFIX: &str = "CAM_ACQUIRE_";

/// Per-session acquisition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Buffer slots allocated on every `start`.
    pub pool_capacity: usize,
    /// Bytes reserved per slot up front; 0 lets the device size buffers.
    pub slot_bytes: usize,
    /// Default `fetch` timeout used by the CLI; `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,
    /// Pause after a transient capture failure.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Longest `stop`/`destroy` waits for the capture thread before detaching it.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            slot_bytes: 0,
            fetch_timeout: Some(Duration::from_secs(5)),
            retry_backoff: Duration::from_millis(10),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl AcquisitionConfig {
    /// Defaults overridden by `CAM_ACQUIRE_*` variables.
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `path`, then `CAM_ACQUIRE_*` variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(AcquireError::Config(
                "pool_capacity must be at least 1".to_owned(),
            ));
        }
        if self.fetch_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(AcquireError::Config(
                "fetch_timeout must be positive (omit it to wait forever)".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Variable naming the producer source to test against.
pub const TEST_TARGET_VAR: &str = "HARVESTERS_TEST_TARGET";
/// Variable holding tracing filter directives.
pub const LOGGING_CONFIG_VAR: &str = "HARVESTERS_LOGGING_CONFIG";
/// Variable naming the file logs are written to.
pub const LOG_BUFFER_VAR: &str = "HARVESTERS_LOG_BUFFER";

/// Environment the hardware harness needs. Tests skip when it is incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessEnv {
    /// Producer source path passed to `add_source`.
    pub target: PathBuf,
    /// Tracing filter directives.
    pub logging_config: String,
    /// Log file path.
    pub log_buffer: PathBuf,
}

impl HarnessEnv {
    /// Read the three harness variables; `None` if any is missing or empty.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        Some(Self {
            target: PathBuf::from(get(TEST_TARGET_VAR)?),
            logging_config: get(LOGGING_CONFIG_VAR)?,
            log_buffer: PathBuf::from(get(LOG_BUFFER_VAR)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.pool_capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = AcquisitionConfig {
            pool_capacity: 0,
            ..AcquisitionConfig::default()
        };
        assert!(matches!(config.validate(), Err(AcquireError::Config(_))));
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "acquire.toml",
                r#"
                pool_capacity = 4
                retry_backoff = "250ms"
                fetch_timeout = "2s"
                join_timeout = "1s"
                "#,
            )?;
            jail.set_env("CAM_ACQUIRE_POOL_CAPACITY", "8");

            let config = AcquisitionConfig::load_from("acquire.toml")
                .map_err(|err| err.to_string())?;
            assert_eq!(config.pool_capacity, 8);
            assert_eq!(config.retry_backoff, Duration::from_millis(250));
            assert_eq!(config.fetch_timeout, Some(Duration::from_secs(2)));
            assert_eq!(config.join_timeout, Duration::from_secs(1));
            assert_eq!(config.slot_bytes, 0);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_env_override_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CAM_ACQUIRE_POOL_CAPACITY", "0");
            assert!(AcquisitionConfig::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn test_harness_env_requires_all_variables() {
        let mut vars = HashMap::from([
            (TEST_TARGET_VAR, "mock://2"),
            (LOGGING_CONFIG_VAR, "cam_acquire=debug"),
            (LOG_BUFFER_VAR, "/tmp/acquire.log"),
        ]);
        let lookup = |vars: &HashMap<&str, &str>, name: &str| vars.get(name).map(|v| (*v).to_owned());

        let env = HarnessEnv::from_lookup(|name| lookup(&vars, name)).expect("complete env");
        assert_eq!(env.target, PathBuf::from("mock://2"));
        assert_eq!(env.logging_config, "cam_acquire=debug");

        vars.insert(LOG_BUFFER_VAR, "");
        assert!(HarnessEnv::from_lookup(|name| lookup(&vars, name)).is_none());

        vars.remove(TEST_TARGET_VAR);
        assert!(HarnessEnv::from_lookup(|name| lookup(&vars, name)).is_none());
    }
}
