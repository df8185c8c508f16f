//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound for the heartbeat interval and timeout (one week).
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Port the WebSocket/REST server listens on.
    pub port: u16,
    /// How often the liveness monitor scans workers and sends probes.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker is reaped.
    pub heartbeat_timeout: Duration,
    /// Capability assumed when a worker registers without declaring any.
    pub default_capability: String,
    /// Capacity of the broadcast channel that carries dispatch events.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            default_capability: "general".to_string(),
            event_capacity: 256,
        }
    }
}

impl DispatcherConfig {
    /// Build the configuration from `DISPATCH_*` environment variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_var(&lookup, "DISPATCH_PORT", defaults.port)?;
        let interval_secs = parse_var(
            &lookup,
            "DISPATCH_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let doubled = interval_secs
            .checked_mul(2)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "DISPATCH_HEARTBEAT_INTERVAL_SECS".to_string(),
                message: format!("{interval_secs} is too large"),
            })?;
        let timeout_secs = parse_var(&lookup, "DISPATCH_HEARTBEAT_TIMEOUT_SECS", doubled)?;
        let default_capability = lookup("DISPATCH_DEFAULT_CAPABILITY")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_capability);
        let event_capacity = parse_var(&lookup, "DISPATCH_EVENT_CAPACITY", defaults.event_capacity)?;

        let config = Self {
            port,
            heartbeat_interval: Duration::from_secs(interval_secs),
            heartbeat_timeout: Duration::from_secs(timeout_secs),
            default_capability,
            event_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the relations between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.heartbeat_interval > MAX_HEARTBEAT {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval".to_string(),
                message: format!("must not exceed {:?}", MAX_HEARTBEAT),
            });
        }
        if self.heartbeat_timeout > MAX_HEARTBEAT {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_timeout".to_string(),
                message: format!("must not exceed {:?}", MAX_HEARTBEAT),
            });
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_timeout".to_string(),
                message: format!(
                    "{:?} must be greater than the heartbeat interval {:?}",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
