//! Configuration types.
//!
//! Service settings come from `AGENT_BOARD_*` environment variables; every
//! value has a default so a bare `agent-board` starts with a local database.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "AGENT_BOARD_";

/// Lease timing shared by the lease manager, the sweep, and workers.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// Lease granted on acquire and renewed from the call time on each heartbeat.
    pub lease_duration: Duration,
    /// How often a running worker heartbeats.
    pub heartbeat_interval: Duration,
    /// Extra time past expiry before the sweep may reclaim a lock.
    pub reclaim_grace: Duration,
    /// Consecutive reclaims after which a ticket is parked in Blocked.
    pub max_reclaims: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300), // 5 minutes
            heartbeat_interval: Duration::from_secs(30),
            reclaim_grace: Duration::from_secs(30),
            max_reclaims: 3,
        }
    }
}

impl LeaseConfig {
    /// Reject settings that would let a single missed heartbeat expire a lease.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}HEARTBEAT_SECS"),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.lease_duration < self.heartbeat_interval * 2 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}LEASE_SECS"),
                message: format!(
                    "lease ({}s) must be at least twice the heartbeat interval ({}s)",
                    self.lease_duration.as_secs(),
                    self.heartbeat_interval.as_secs()
                ),
            });
        }
        if self.max_reclaims == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}MAX_RECLAIMS"),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for in-process workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Idle poll interval.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Shell command run for each claimed ticket. `None` disables execution.
    pub agent_command: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            agent_command: None,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub lease: LeaseConfig,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// Interval between keep-alive frames on the event stream.
    pub keepalive_interval: Duration,
    pub agent_command: Option<String>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/agent-board.db"),
            port: 8080,
            lease: LeaseConfig::default(),
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            agent_command: None,
        }
    }
}

impl BoardConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).filter(|v| !v.trim().is_empty()).map(|v| (key, v))
        };

        let heartbeat_interval = secs(get("HEARTBEAT_SECS"))?.unwrap_or(defaults.lease.heartbeat_interval);
        let lease = LeaseConfig {
            lease_duration: secs(get("LEASE_SECS"))?.unwrap_or(defaults.lease.lease_duration),
            heartbeat_interval,
            // Grace follows the heartbeat interval unless set explicitly.
            reclaim_grace: secs(get("RECLAIM_GRACE_SECS"))?.unwrap_or(heartbeat_interval),
            max_reclaims: parse(get("MAX_RECLAIMS"))?.unwrap_or(defaults.lease.max_reclaims),
        };

        let config = Self {
            db_path: get("DB_PATH")
                .map(|(_, v)| PathBuf::from(v))
                .unwrap_or(defaults.db_path),
            port: parse(get("PORT"))?.unwrap_or(defaults.port),
            lease,
            poll_interval: secs(get("POLL_SECS"))?.unwrap_or(defaults.poll_interval),
            sweep_interval: secs(get("SWEEP_SECS"))?.unwrap_or(defaults.sweep_interval),
            keepalive_interval: secs(get("KEEPALIVE_SECS"))?.unwrap_or(defaults.keepalive_interval),
            agent_command: get("AGENT_CMD").map(|(_, v)| v),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lease.validate()?;
        for (name, value) in [
            ("POLL_SECS", self.poll_interval),
            ("SWEEP_SECS", self.sweep_interval),
            ("KEEPALIVE_SECS", self.keepalive_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{name}"),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Worker settings derived from the service configuration.
    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.lease.heartbeat_interval,
            agent_command: self.agent_command.clone(),
        }
    }
}

fn parse<T>(entry: Option<(String, String)>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    entry
        .map(|(key, raw)| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    message: format!("{raw:?}: {e}"),
                })
        })
        .transpose()
}

fn secs(entry: Option<(String, String)>) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(entry)?.map(Duration::from_secs))
}

/// Subscriber-side reconnect policy for the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Fixed delay between reconnect attempts.
    pub retry_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            max_retries: 5,
        }
    }
}
