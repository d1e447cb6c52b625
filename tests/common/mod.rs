//! Shared test setup: tracing and tree inspection helpers.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... build a tree, run threads ...
//!     common::assert_healthy(&tree, "my_test");
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `blinkhash=debug,blinkhash::tree::convert=trace`)
//! - `BLINKHASH_LOG_DIR`: Log directory (default: `logs/`)
//! - `BLINKHASH_LOG_CONSOLE`: Set to "0" to disable console output
//! - `BLINKHASH_LOG_FILE`: Set to "0" to disable the JSON log file
//!
//! The library only emits events when built with `--features tracing`.
//!
//! # Log Files
//!
//! Logs are appended to `logs/blinkhash.jsonl`, one JSON object per line:
//!
//! ```bash
//! # Every split at one key
//! jq 'select(.fields.split_key == "16")' logs/blinkhash.jsonl
//!
//! # Conversions per thread
//! jq -r 'select(.fields.message == "converted hash leaf") | .threadId' logs/blinkhash.jsonl | sort | uniq -c
//!
//! # Invariant violations
//! jq 'select(.level == "ERROR")' logs/blinkhash.jsonl
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use blinkhash::{IndexKey, IndexValue, Tree};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Install the global subscriber. Only the first call has an effect.
pub fn init_tracing() {
    INIT.call_once(|| install(&TracingConfig::from_env()));
}

/// Where test logs go.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub log_dir: PathBuf,
    pub log_file: String,
    pub console_enabled: bool,
    pub file_enabled: bool,
    /// Used when `RUST_LOG` is unset.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "blinkhash.jsonl".to_string(),
            console_enabled: true,
            file_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let disabled = |var: &str| env::var(var).is_ok_and(|v| v == "0");
        let mut config = Self::default();

        if let Ok(dir) = env::var("BLINKHASH_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.console_enabled = !disabled("BLINKHASH_LOG_CONSOLE");
        config.file_enabled = !disabled("BLINKHASH_LOG_FILE");

        config
    }

    /// Open the log file for appending; nextest runs each test in its own
    /// process, so several processes share it.
    fn open_log(&self) -> Option<File> {
        std::fs::create_dir_all(&self.log_dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(&self.log_file))
            .ok()
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_level.as_str()))
    }
}

fn install(config: &TracingConfig) {
    let console = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .with_filter(config.filter())
    });

    let file = config.file_enabled.then(|| config.open_log()).flatten().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_filter(config.filter())
    });

    // Another test harness may already own the global subscriber.
    let _ = Registry::default().with(console).with(file).try_init();
}

/// Panic with the tree's stats if any structural invariant is broken.
pub fn assert_healthy<K: IndexKey, V: IndexValue>(tree: &Tree<K, V>, test_name: &str) {
    let ti = tree.thread_info();
    if let Err(violation) = tree.sanity_check(&ti) {
        tracing::error!(test = test_name, %violation, stats = ?tree.stats(), "unhealthy tree");
        panic!("{test_name}: {violation}\nstats: {:?}", tree.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialized");
        tracing::debug!(split_key = 16, hashed = true, "leaf split");
    }
}
