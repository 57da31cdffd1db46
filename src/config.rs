use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{AllocationPolicy, Ms, HOUR, MINUTE};

/// Knobs the engine itself reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest allowed reservation window.
    pub max_reservation_ms: Ms,
    /// How long an occupying reservation may overstay before a forced exit.
    pub grace_ms: Ms,
    /// Policy for parkings created without an explicit one.
    pub default_policy: AllocationPolicy,
    /// Attempts per operation when a sector compare-and-swap is lost.
    pub capacity_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_reservation_ms: 24 * HOUR,
            grace_ms: 15 * MINUTE,
            default_policy: AllocationPolicy::LeastOccupied,
            capacity_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl Config {
    /// Read `PARKD_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineConfig::default();
        let parsed = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };
        let minutes = |key: &str, default: Ms| -> Ms {
            parse_or(parsed(key), default / MINUTE).saturating_mul(MINUTE)
        };
        let positive_minutes = |key: &str, default: Ms| -> Ms {
            positive_or(key, minutes(key, default), default)
        };

        let grace_ms = match minutes("PARKD_GRACE_MINUTES", defaults.grace_ms) {
            negative if negative < 0 => {
                tracing::warn!("PARKD_GRACE_MINUTES={} is negative; using the default", negative / MINUTE);
                defaults.grace_ms
            }
            grace => grace,
        };

        let policy = parsed("PARKD_DEFAULT_POLICY").map(|v| v.parse::<AllocationPolicy>());
        let default_policy = match policy {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                tracing::warn!("{e}; using {}", defaults.default_policy.as_str());
                defaults.default_policy
            }
            None => defaults.default_policy,
        };

        Self {
            data_dir: PathBuf::from(parsed("PARKD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: parsed("PARKD_METRICS_PORT").and_then(|s| s.parse().ok()),
            sweep_interval: Duration::from_secs(positive_or(
                "PARKD_SWEEP_INTERVAL_SECS",
                parse_or(parsed("PARKD_SWEEP_INTERVAL_SECS"), 60),
                60,
            )),
            compact_threshold: parse_or(parsed("PARKD_COMPACT_THRESHOLD"), 10_000),
            engine: EngineConfig {
                max_reservation_ms: positive_minutes(
                    "PARKD_MAX_RESERVATION_MINUTES",
                    defaults.max_reservation_ms,
                ),
                grace_ms,
                default_policy,
                capacity_retries: positive_or(
                    "PARKD_CAPACITY_RETRIES",
                    parse_or(parsed("PARKD_CAPACITY_RETRIES"), defaults.capacity_retries),
                    defaults.capacity_retries,
                ),
                retry_backoff_ms: parse_or(parsed("PARKD_RETRY_BACKOFF_MS"), defaults.retry_backoff_ms),
            },
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Zero or negative is as unusable as garbage for these knobs.
fn positive_or<T>(key: &str, value: T, default: T) -> T
where
    T: Copy + PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        tracing::warn!("{key} must be greater than zero; using {default}");
        default
    } else {
        value
    }
}
