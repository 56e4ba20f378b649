//! Scheduler configuration.

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// Largest supported parallelism (the width of the packed worker counts).
pub const MAX_PARALLELISM: usize = 0x7fff;

/// Default number of spare workers allowed above parallelism.
pub const DEFAULT_MAX_SPARES: usize = 256;

/// Default idle time before the last idle worker retires.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(2);

const ENV_PARALLELISM: &str = "WEFT_COMMON_PARALLELISM";
const ENV_MAX_SPARES: &str = "WEFT_COMMON_MAX_SPARES";
const ENV_KEEP_ALIVE_MS: &str = "WEFT_KEEP_ALIVE_MS";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target number of active workers.
    pub parallelism: usize,
    /// Drain local queues first-in-first-out. Suited to event-style tasks
    /// that are never joined.
    pub async_mode: bool,
    /// Spare workers allowed above `parallelism` while workers are blocked.
    pub max_spares: usize,
    /// Idle time before the last idle worker retires.
    pub keep_alive: Duration,
    /// Spins an inactive worker performs before parking.
    pub idle_spins: u32,
    /// Stack size for worker threads.
    pub stack_size: Option<usize>,
    /// Worker thread name prefix; the worker number is appended.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus(),
            async_mode: false,
            max_spares: DEFAULT_MAX_SPARES,
            keep_alive: DEFAULT_KEEP_ALIVE,
            idle_spins: 0,
            stack_size: None,
            thread_name_prefix: "weft-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with the given parallelism.
    #[must_use]
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Self::default()
        }
    }

    /// Check that the configuration can be used to build a scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::Parallelism {
                got: self.parallelism,
                max: MAX_PARALLELISM,
            });
        }
        Ok(())
    }

    /// Configuration of the common scheduler, with environment overrides.
    ///
    /// Parallelism defaults to one less than the number of cores, and never
    /// less than one. Malformed overrides are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            parallelism: num_cpus().saturating_sub(1).max(1),
            thread_name_prefix: "weft-common".to_string(),
            ..Self::default()
        };
        if let Some(p) = env_or_warn::<usize>(ENV_PARALLELISM) {
            config.parallelism = p.clamp(1, MAX_PARALLELISM);
        }
        if let Some(spares) = env_or_warn::<usize>(ENV_MAX_SPARES) {
            config.max_spares = spares;
        }
        if let Some(ms) = env_or_warn::<u64>(ENV_KEEP_ALIVE_MS) {
            config.keep_alive = Duration::from_millis(ms);
        }
        config
    }
}

/// Read an environment override.
pub fn env_override<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                var,
                reason: e.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_or_warn<T>(var: &'static str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_override(var).unwrap_or_else(|err| {
        tracing::warn!(%err, "ignoring scheduler override");
        None
    })
}

/// Get the number of available CPUs.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(config.parallelism >= 1);
        assert!(!config.async_mode);
        assert_eq!(config.max_spares, DEFAULT_MAX_SPARES);
        assert_eq!(config.keep_alive, Duration::from_secs(2));
        assert_eq!(config.thread_name_prefix, "weft-worker");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_parallelism() {
        let zero = SchedulerConfig::with_parallelism(0);
        assert_eq!(
            zero.validate(),
            Err(ConfigError::Parallelism {
                got: 0,
                max: MAX_PARALLELISM
            })
        );
        let huge = SchedulerConfig::with_parallelism(MAX_PARALLELISM + 1);
        assert!(huge.validate().is_err());
        assert!(SchedulerConfig::with_parallelism(MAX_PARALLELISM)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_env_override_parses_and_reports() {
        std::env::set_var("WEFT_TEST_OVERRIDE_OK", " 12 ");
        assert_eq!(env_override::<usize>("WEFT_TEST_OVERRIDE_OK"), Ok(Some(12)));

        std::env::set_var("WEFT_TEST_OVERRIDE_BAD", "many");
        let err = env_override::<usize>("WEFT_TEST_OVERRIDE_BAD").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { var: "WEFT_TEST_OVERRIDE_BAD", ref value, .. } if value == "many"
        ));

        assert_eq!(env_override::<usize>("WEFT_TEST_OVERRIDE_UNSET"), Ok(None));
    }

    #[test]
    fn test_common_config_has_at_least_one_worker() {
        let config = SchedulerConfig::from_env();
        assert!(config.parallelism >= 1);
        assert!(config.validate().is_ok());
    }
}
