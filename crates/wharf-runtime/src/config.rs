//! Runtime configuration: defaults, optional file, `WHARF_` environment.

use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Which storage driver backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDriver {
    /// In-memory driver: tests and ephemeral runs.
    Memory,
    /// SQLite driver: durable single-node runs.
    Sqlite,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Selected driver.
    pub driver: StorageDriver,
    /// Database path for the SQLite driver.
    pub sqlite_path: String,
    /// Consumer dedup record TTL in seconds.
    pub dedup_ttl_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Memory,
            sqlite_path: "wharf.db".to_owned(),
            dedup_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Rows claimed per cycle.
    pub batch_size: usize,
    /// Row lease in seconds.
    pub lease_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 100,
            lease_secs: 30,
        }
    }
}

impl RelaySettings {
    pub(crate) fn to_relay_config(&self) -> wharf_relay::RelayConfig {
        wharf_relay::RelayConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            lease: Duration::from_secs(self.lease_secs),
        }
    }
}

/// Consumer worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Reservation lease in seconds.
    pub lease_secs: u64,
    /// Handler attempts before dead-lettering.
    pub max_retries: u32,
    /// Pause between handler attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl ConsumerSettings {
    pub(crate) fn to_consumer_config(&self) -> wharf_consumer::ConsumerConfig {
        wharf_consumer::ConsumerConfig {
            lease: Duration::from_secs(self.lease_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Circuit-breaker settings shared by every guarded dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures tripping the breaker.
    pub failure_threshold: u32,
    /// Open cool-down in seconds.
    pub open_timeout_secs: u64,
    /// Probes admitted while half-open.
    pub half_open_probes: u32,
    /// Probe successes required to close.
    pub success_threshold: u32,
    /// Windowed failure ratio that also trips.
    pub failure_ratio: f64,
    /// Outcome window size.
    pub window: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 30,
            half_open_probes: 3,
            success_threshold: 2,
            failure_ratio: 0.5,
            window: 10,
        }
    }
}

impl BreakerSettings {
    pub(crate) fn to_breaker_config(&self) -> wharf_resilience::BreakerConfig {
        wharf_resilience::BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            half_open_probes: self.half_open_probes,
            success_threshold: self.success_threshold,
            failure_ratio: self.failure_ratio,
            window: self.window,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Service name; becomes the CloudEvents `source` and the idempotency
    /// scope.
    pub service_name: String,
    /// Live-tail buffer per bus topic.
    pub bus_buffer: usize,
    /// Storage settings.
    pub storage: StorageSettings,
    /// Relay settings.
    pub relay: RelaySettings,
    /// Consumer settings.
    pub consumer: ConsumerSettings,
    /// Breaker settings.
    pub breaker: BreakerSettings,
    /// HTTP idempotency lock lease in seconds.
    pub idempotency_lock_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "fulfillment-service".to_owned(),
            bus_buffer: 1024,
            storage: StorageSettings::default(),
            relay: RelaySettings::default(),
            consumer: ConsumerSettings::default(),
            breaker: BreakerSettings::default(),
            idempotency_lock_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// Layer defaults, an optional `wharf.toml`, and `WHARF_`-prefixed
    /// environment variables (`WHARF_RELAY__BATCH_SIZE=50`).
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&RuntimeConfig::default())?;
        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("wharf").required(false))
            .add_source(Environment::with_prefix("WHARF").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let config = RuntimeConfig::default();
        assert_eq!(config.relay.poll_interval_ms, 1000);
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.open_timeout_secs, 30);
        assert_eq!(config.consumer.max_retries, 3);
        assert_eq!(config.storage.driver, StorageDriver::Memory);
    }

    #[test]
    fn load_without_file_or_env_yields_defaults() {
        let config = RuntimeConfig::load().unwrap();
        assert_eq!(config.service_name, "fulfillment-service");
        assert_eq!(config.bus_buffer, 1024);
    }
}
