//! Instrumentation settings.
//!
//! Settings are read from the process environment the same way for every
//! process of the group, so the region size computed by the postmaster-like
//! owner matches what each backend expects:
//! - `PLANSTAT_ENABLE_QUERY_METRICS` (default: off)
//! - `PLANSTAT_MAX_SHMEM_INSTRUMENTS` (default: 5000, 0 disables the region)
//! - `PLANSTAT_QUERY_METRICS_PORT` (default: 9898)
//! - `PLANSTAT_SEGMENT_INTERVAL_MS` (default: 1000)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default number of shared instrumentation slots.
pub const DEFAULT_MAX_SHMEM_INSTRUMENTS: usize = 5000;

/// Default UDP port of the local monitoring listener.
pub const DEFAULT_QUERY_METRICS_PORT: u16 = 9898;

/// Default period between two segment-info packets.
pub const DEFAULT_SEGMENT_INTERVAL: Duration = Duration::from_millis(1000);

const ENV_ENABLE_QUERY_METRICS: &str = "PLANSTAT_ENABLE_QUERY_METRICS";
const ENV_MAX_SHMEM_INSTRUMENTS: &str = "PLANSTAT_MAX_SHMEM_INSTRUMENTS";
const ENV_QUERY_METRICS_PORT: &str = "PLANSTAT_QUERY_METRICS_PORT";
const ENV_SEGMENT_INTERVAL_MS: &str = "PLANSTAT_SEGMENT_INTERVAL_MS";

/// Error type for invalid configuration values.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A setting could not be parsed or is out of range.
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "invalid value '{}' for {}: {}", value, key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings shared by the slot allocator, telemetry and the segment-info sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    /// Use shared-memory slots and send node/query telemetry.
    pub enable_query_metrics: bool,
    /// Capacity of the shared slot pool.
    pub max_shmem_instruments: usize,
    /// Port of the monitoring listener on the loopback interface.
    pub query_metrics_port: u16,
    /// Period between two segment-info packets. Always non-zero.
    pub segment_interval: Duration,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            enable_query_metrics: false,
            max_shmem_instruments: DEFAULT_MAX_SHMEM_INSTRUMENTS,
            query_metrics_port: DEFAULT_QUERY_METRICS_PORT,
            segment_interval: DEFAULT_SEGMENT_INTERVAL,
        }
    }
}

impl InstrumentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_metrics(mut self, enabled: bool) -> Self {
        self.enable_query_metrics = enabled;
        self
    }

    pub fn with_max_shmem_instruments(mut self, slots: usize) -> Self {
        self.max_shmem_instruments = slots;
        self
    }

    pub fn with_query_metrics_port(mut self, port: u16) -> Self {
        self.query_metrics_port = port;
        self
    }

    /// Sets the segment-info period. A zero period is ignored.
    pub fn with_segment_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.segment_interval = interval;
        }
        self
    }

    /// Reads settings from the process environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`InstrumentConfig::from_env`] with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ENABLE_QUERY_METRICS) {
            config.enable_query_metrics = parse_bool(ENV_ENABLE_QUERY_METRICS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_SHMEM_INSTRUMENTS) {
            config.max_shmem_instruments = parse_number(ENV_MAX_SHMEM_INSTRUMENTS, &value)?;
        }
        if let Some(value) = lookup(ENV_QUERY_METRICS_PORT) {
            config.query_metrics_port = parse_number(ENV_QUERY_METRICS_PORT, &value)?;
        }
        if let Some(value) = lookup(ENV_SEGMENT_INTERVAL_MS) {
            let ms: u64 = parse_number(ENV_SEGMENT_INTERVAL_MS, &value)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SEGMENT_INTERVAL_MS,
                    value,
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.segment_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected on/off".to_string(),
        }),
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
