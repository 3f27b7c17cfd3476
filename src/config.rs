use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Tunables for metering, refunds and expiry.
///
/// Defaults reproduce the production policy: a charge is refunded when the
/// reader saw less than 70% of the viewport on average or stayed under
/// roughly twenty seconds of focused time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerPolicy {
    /// Minimum mean visibility over all ticks for a charge to count.
    pub visibility_min: f64,

    /// Minimum focused minutes for a charge to count.
    pub min_valid_minutes: f64,

    /// How far a focused tick pushes `expires_at` out.
    pub renewal_window_secs: u64,

    /// Focused ticks closer than this to expiry renew the reservation early.
    pub renewal_lookahead_secs: u64,

    /// Default TTL for per-read reservations.
    pub per_read_ttl_secs: u64,

    /// Floor for the default per-minute TTL.
    pub min_per_minute_ttl_secs: u64,

    /// Added on top of `cap_minutes * 60` for the default per-minute TTL.
    pub ttl_buffer_secs: u64,

    /// `percent_used` at or above this asks the client to top up.
    pub needs_deposit_ratio: f64,

    /// Upper bound accepted for a quote's cap.
    pub max_cap_minutes: u32,

    /// Explicit quote TTLs are clamped to this.
    pub max_ttl_secs: u64,

    /// Optimistic-concurrency retries before a conflict is surfaced.
    pub max_cas_retries: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        LedgerPolicy {
            visibility_min: 0.70,
            min_valid_minutes: 0.33,
            renewal_window_secs: 120,
            renewal_lookahead_secs: 60,
            per_read_ttl_secs: 900,
            min_per_minute_ttl_secs: 600,
            ttl_buffer_secs: 120,
            needs_deposit_ratio: 0.90,
            max_cap_minutes: 1_440,
            max_ttl_secs: 172_800,
            max_cas_retries: 16,
        }
    }
}

/// Configuration for the ledger and its operator CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path (default: `.metered-ledger/` in current directory)
    pub data_dir: PathBuf,

    /// Output format: "human" (default) or "json"
    pub output_format: String,

    /// Log level: "info", "debug", "warn", "error" (default: "info")
    pub log_level: String,

    /// Journal entries written between snapshots (0 disables snapshots)
    pub snapshot_every: u64,

    pub policy: LedgerPolicy,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        let data_dir = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".metered-ledger");

        Config {
            data_dir,
            output_format: "human".to_string(),
            log_level: "info".to_string(),
            snapshot_every: 256,
            policy: LedgerPolicy::default(),
        }
    }

    /// Create config with custom data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            ..Config::new()
        }
    }

    pub fn get_data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    pub fn get_output_format(&self) -> &str {
        &self.output_format
    }

    /// Set output format ("human" or "json")
    pub fn set_output_format(&mut self, format: String) {
        self.output_format = format;
    }

    pub fn get_log_level(&self) -> &str {
        &self.log_level
    }

    pub fn set_log_level(&mut self, level: String) {
        self.log_level = level;
    }

    /// Append-only journal of committed writes
    pub fn get_journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.log")
    }

    /// Ledger snapshot (bincode `LedgerState` + journal position)
    pub fn get_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("snapshot.bin")
    }

    /// Held exclusively by the process that has the store open
    pub fn get_lock_path(&self) -> PathBuf {
        self.data_dir.join("ledger.lock")
    }

    /// Load config from environment variables
    ///
    /// Environment variables:
    /// - `METERED_LEDGER_DATA_DIR`: override data directory
    /// - `METERED_LEDGER_OUTPUT_FORMAT`: "human" or "json"
    /// - `METERED_LEDGER_LOG_LEVEL`: log level
    /// - `METERED_LEDGER_SNAPSHOT_EVERY`: journal entries between snapshots
    pub fn from_env() -> Self {
        let mut config = Config::new();

        if let Ok(dir) = env::var("METERED_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(format) = env::var("METERED_LEDGER_OUTPUT_FORMAT") {
            config.output_format = format;
        }

        if let Ok(level) = env::var("METERED_LEDGER_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(every) = env::var("METERED_LEDGER_SNAPSHOT_EVERY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.snapshot_every = every;
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
