//! Configuration for the kitchen-orders demo.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LEASE_SECS: i64 = 30;

/// Demo configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// `PostgreSQL` connection URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Ledger lease duration in seconds
    pub lease_duration_secs: i64,
    /// Redelivery configuration
    pub delivery: DeliveryConfig,
    /// Kitchen service fault configuration
    pub faults: FaultConfig,
    /// Number of distinct orders to place
    pub orders: usize,
    /// Copies of each order delivered concurrently
    pub duplicate_deliveries: usize,
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
}

/// Redelivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Redeliveries after the first attempt before dead-lettering
    pub max_retries: usize,
    /// Delay before the first redelivery, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on any redelivery delay, in milliseconds
    pub max_delay_ms: u64,
}

/// Kitchen service fault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Probability that a kitchen call fails, in `[0, 1]`
    pub rate: f64,
    /// Seed for the fault generator
    pub seed: u64,
    /// Simulated kitchen latency in milliseconds
    pub latency_ms: u64,
}

impl DemoConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if set.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            lease_duration_secs: parsed(&lookup, "LEASE_DURATION_SECS")
                .filter(|secs: &i64| *secs > 0)
                .unwrap_or(DEFAULT_LEASE_SECS),
            delivery: DeliveryConfig {
                max_retries: parsed(&lookup, "DELIVERY_MAX_RETRIES").unwrap_or(8),
                initial_delay_ms: parsed(&lookup, "DELIVERY_INITIAL_DELAY_MS").unwrap_or(20),
                max_delay_ms: parsed(&lookup, "DELIVERY_MAX_DELAY_MS").unwrap_or(1000),
            },
            faults: FaultConfig {
                rate: parsed(&lookup, "FAULT_RATE").unwrap_or(0.2_f64).clamp(0.0, 1.0),
                seed: parsed(&lookup, "FAULT_SEED").unwrap_or(42),
                latency_ms: parsed(&lookup, "KITCHEN_LATENCY_MS").unwrap_or(5),
            },
            orders: parsed(&lookup, "ORDERS").unwrap_or(10),
            duplicate_deliveries: parsed(&lookup, "DUPLICATE_DELIVERIES").unwrap_or(3).max(1),
            metrics_host: lookup("METRICS_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            metrics_port: parsed(&lookup, "METRICS_PORT").unwrap_or(9090),
        }
    }

    /// Lease duration as a `chrono` duration.
    ///
    /// Out-of-range values fall back to the default.
    #[must_use]
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.lease_duration_secs)
            .filter(|duration| *duration > chrono::Duration::zero())
            .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_LEASE_SECS))
    }

    /// Simulated kitchen latency.
    #[must_use]
    pub const fn kitchen_latency(&self) -> Duration {
        Duration::from_millis(self.faults.latency_ms)
    }

    /// Metrics server address string.
    #[must_use]
    pub fn metrics_address(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.parse().ok())
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> DemoConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        DemoConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_use_the_in_memory_store() {
        let config = DemoConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.lease_duration_secs, 30);
        assert_eq!(config.delivery.max_retries, 8);
        assert_eq!(config.duplicate_deliveries, 3);
        assert_eq!(config.metrics_address(), "0.0.0.0:9090");
    }

    #[test]
    fn variables_override_defaults() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/kitchen"),
            ("LEASE_DURATION_SECS", "5"),
            ("FAULT_RATE", "0.5"),
            ("DUPLICATE_DELIVERIES", "7"),
            ("METRICS_PORT", "9191"),
        ]);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/kitchen"));
        assert_eq!(config.lease_duration(), chrono::Duration::seconds(5));
        assert!((config.faults.rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.duplicate_deliveries, 7);
        assert_eq!(config.metrics_port, 9191);
    }

    #[test]
    fn out_of_range_values_are_clamped_and_garbage_ignored() {
        let config = config_from(&[
            ("DATABASE_URL", ""),
            ("FAULT_RATE", "3"),
            ("DUPLICATE_DELIVERIES", "0"),
            ("ORDERS", "many"),
        ]);
        assert!(config.database_url.is_none());
        assert!((config.faults.rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.duplicate_deliveries, 1);
        assert_eq!(config.orders, 10);
    }

    #[test]
    fn unusable_lease_durations_fall_back_to_the_default() {
        let negative = config_from(&[("LEASE_DURATION_SECS", "-3")]);
        assert_eq!(negative.lease_duration_secs, 30);

        let zero = config_from(&[("LEASE_DURATION_SECS", "0")]);
        assert_eq!(zero.lease_duration(), chrono::Duration::seconds(30));

        let max = i64::MAX.to_string();
        let huge = config_from(&[("LEASE_DURATION_SECS", max.as_str())]);
        assert_eq!(huge.lease_duration(), chrono::Duration::seconds(30));
    }
}
