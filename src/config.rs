//! Environment-style configuration.
//!
//! All settings come from the process environment (a `.env` file is
//! honored via dotenvy in `main`). Missing required variables or
//! unparsable values fail fast before any message is consumed.

use anyhow::{Context, Result, bail};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::window::WindowConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bus subscription identifier, used for logging and shard naming.
    pub bus_subscription: String,
    pub stops_csv_path: String,
    pub sink_table_path: String,
    pub window: WindowConfig,
    /// Upstream GTFS-RT feed URL for the built-in fetcher task. Only
    /// required by the `run` command.
    pub feed_url: Option<String>,
    pub fetch_interval: Duration,
    pub fetch_timeout: Duration,
    pub sink_max_retries: u32,
    pub sink_retry_backoff: Duration,
    pub shard_count: usize,
    /// Flush buffered windows through enrichment and the sink on
    /// shutdown; `false` abandons them.
    pub flush_on_shutdown: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let window_slice = parsed_or("WINDOW_SLICE_SECS", 30u64)?;
        if window_slice == 0 {
            bail!("WINDOW_SLICE_SECS must be at least 1");
        }
        let early_trigger = parsed_or("EARLY_TRIGGER_SECS", 5u64)?;
        let early_count = parsed_or("EARLY_TRIGGER_COUNT", 0usize)?;

        let shard_count = parsed_or("SHARD_COUNT", 1usize)?;
        if shard_count == 0 {
            bail!("SHARD_COUNT must be at least 1");
        }

        Ok(Self {
            bus_subscription: required("BUS_SUBSCRIPTION")?,
            stops_csv_path: required("STOPS_CSV_PATH")?,
            sink_table_path: required("SINK_TABLE_PATH")?,
            window: WindowConfig {
                slice: Duration::from_secs(window_slice),
                // 0 disables either early trigger.
                early_quantum: (early_trigger > 0).then(|| Duration::from_secs(early_trigger)),
                count_threshold: (early_count > 0).then_some(early_count),
                fire_on_first: parsed_or("FIRE_ON_FIRST_RECORD", true)?,
                allowed_lateness: Duration::from_secs(parsed_or("ALLOWED_LATENESS_SECS", 10u64)?),
            },
            feed_url: env::var("FEED_URL").ok().filter(|v| !v.is_empty()),
            fetch_interval: Duration::from_secs(parsed_or("FETCH_INTERVAL_SECS", 15u64)?),
            fetch_timeout: Duration::from_secs(parsed_or("FETCH_TIMEOUT_SECS", 10u64)?),
            sink_max_retries: parsed_or("SINK_MAX_RETRIES", 3u32)?,
            sink_retry_backoff: Duration::from_millis(parsed_or("SINK_RETRY_BACKOFF_MS", 500u64)?),
            shard_count,
            flush_on_shutdown: parsed_or("FLUSH_ON_SHUTDOWN", true)?,
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn parsed_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so
    // parallel test threads never race on the shared environment.
    #[test]
    fn test_from_env() {
        unsafe {
            env::remove_var("BUS_SUBSCRIPTION");
            env::set_var("STOPS_CSV_PATH", "stops.csv");
            env::set_var("SINK_TABLE_PATH", "table.csv");
        }

        // Required variable absent: fails fast and names the variable.
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("BUS_SUBSCRIPTION"));

        unsafe {
            env::set_var("BUS_SUBSCRIPTION", "mta-gtfs-ace-sub");
            env::set_var("WINDOW_SLICE_SECS", "10");
            env::set_var("EARLY_TRIGGER_SECS", "0");
            env::set_var("EARLY_TRIGGER_COUNT", "25");
            env::set_var("ALLOWED_LATENESS_SECS", "2");
        }

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.bus_subscription, "mta-gtfs-ace-sub");
        assert_eq!(cfg.window.slice, Duration::from_secs(10));
        assert_eq!(cfg.window.early_quantum, None);
        assert_eq!(cfg.window.count_threshold, Some(25));
        assert_eq!(cfg.window.allowed_lateness, Duration::from_secs(2));
        assert_eq!(cfg.shard_count, 1);
        assert!(cfg.flush_on_shutdown);

        // Unparsable numeric fails fast.
        unsafe {
            env::set_var("WINDOW_SLICE_SECS", "ten");
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("WINDOW_SLICE_SECS"));

        unsafe {
            env::remove_var("WINDOW_SLICE_SECS");
            env::remove_var("EARLY_TRIGGER_SECS");
            env::remove_var("EARLY_TRIGGER_COUNT");
            env::remove_var("ALLOWED_LATENESS_SECS");
        }
    }
}
