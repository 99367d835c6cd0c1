//! Application configuration loaded from environment variables.

use std::time::Duration;

use event_bus::InMemoryBus;
use participants::ParticipantsConfig;
use saga::CoordinatorConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `SAGA_STEP_TIMEOUT_MS`: reply timeout per saga step (default: `30000`)
/// - `SAGA_ABORT_WAIT_MS`: how long DELETE waits for compensation (default: `10000`)
/// - `MAX_RETAINED_SAGAS`: finished sagas kept in memory (default: `1000`)
/// - `BUS_PARTITIONS`: partitions per bus topic (default: `4`)
/// - `BUS_RETAINED_RECORDS`: records kept per bus partition (default: `10000`)
/// - `PAYMENT_LIMIT_CENTS`: largest charge the payment participant accepts (default: none)
/// - `DEFAULT_STOCK`: stock of products not stocked explicitly (default: `100`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub step_timeout: Duration,
    pub abort_wait: Duration,
    pub max_retained_sagas: usize,
    pub bus_partitions: usize,
    pub bus_retained_records: usize,
    pub payment_limit_cents: Option<u64>,
    pub default_stock: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            step_timeout: parsed("SAGA_STEP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_timeout),
            abort_wait: parsed("SAGA_ABORT_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.abort_wait),
            max_retained_sagas: parsed("MAX_RETAINED_SAGAS").unwrap_or(defaults.max_retained_sagas),
            bus_partitions: parsed("BUS_PARTITIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.bus_partitions),
            bus_retained_records: parsed("BUS_RETAINED_RECORDS").unwrap_or(defaults.bus_retained_records),
            payment_limit_cents: parsed("PAYMENT_LIMIT_CENTS"),
            default_stock: parsed("DEFAULT_STOCK").unwrap_or(defaults.default_stock),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bus(&self) -> InMemoryBus {
        InMemoryBus::with_partitions(self.bus_partitions).with_retention(self.bus_retained_records)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_step_timeout(self.step_timeout)
            .with_abort_wait(self.abort_wait)
            .with_max_retained_sagas(self.max_retained_sagas)
    }

    pub fn participants(&self) -> ParticipantsConfig {
        let config = ParticipantsConfig::default().with_default_stock(self.default_stock);
        match self.payment_limit_cents {
            Some(limit) => config.with_payment_limit_cents(limit),
            None => config,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            step_timeout: coordinator.step_timeout,
            abort_wait: coordinator.abort_wait,
            max_retained_sagas: coordinator.max_retained_sagas,
            bus_partitions: event_bus::memory::DEFAULT_PARTITIONS,
            bus_retained_records: event_bus::memory::DEFAULT_RETAINED_RECORDS,
            payment_limit_cents: None,
            default_stock: ParticipantsConfig::default().default_stock,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
