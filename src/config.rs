//! Process-wide configuration, loaded once from the environment at startup.
//!
//! Nothing outside [`Config::from_env`] reads `std::env` directly; every
//! component receives a `Config` (or a field copied out of one) through
//! explicit construction.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub poll_interval: Duration,
    pub modbus_timeout: Duration,
    pub buffer_threshold: usize,
    pub buffer_max_hold: Duration,
    pub retention_days: i64,
    pub config_pin: String,
    pub bind_addr: String,

    pub min_device_timeout: Duration,
    pub stale_window: Duration,
    pub max_pause_wait: Duration,
    pub subscriber_queue_capacity: usize,
    pub subscriber_evict_after_drops: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set (sqlite file path for the registry/store)")?;

        let poll_interval_secs: u64 = env_parse("POLL_INTERVAL", 5)?;
        let modbus_timeout_secs: u64 = env_parse("MODBUS_TIMEOUT", 5)?;
        let buffer_threshold: usize = env_parse("BUFFER_THRESHOLD", 100)?;
        let buffer_max_hold_secs: u64 = env_parse("BUFFER_MAX_HOLD", 5)?;
        let retention_days: i64 = env_parse("RETENTION_DAYS", 2)?;
        let config_pin = env_or("CONFIG_PIN", "1234");
        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8000");

        let min_device_timeout_ms: u64 = env_parse("MIN_DEVICE_TIMEOUT_MS", 200)?;
        let stale_window_secs: u64 = env_parse("STALE_WINDOW_SECS", poll_interval_secs * 3)?;
        let max_pause_wait_ms: u64 = env_parse("MAX_PAUSE_WAIT_MS", 2000)?;
        let subscriber_queue_capacity: usize = env_parse("SUBSCRIBER_QUEUE_CAPACITY", 64)?;
        let subscriber_evict_after_drops: u32 = env_parse("SUBSCRIBER_EVICT_AFTER_DROPS", 3)?;

        Ok(Config {
            database_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            modbus_timeout: Duration::from_secs(modbus_timeout_secs),
            buffer_threshold,
            buffer_max_hold: Duration::from_secs(buffer_max_hold_secs),
            retention_days,
            config_pin,
            bind_addr,
            min_device_timeout: Duration::from_millis(min_device_timeout_ms),
            stale_window: Duration::from_secs(stale_window_secs),
            max_pause_wait: Duration::from_millis(max_pause_wait_ms),
            subscriber_queue_capacity,
            subscriber_evict_after_drops,
        })
    }
}

/// The enumerated baud rates accepted by Device validation.
pub const ALLOWED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];
