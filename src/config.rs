use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Server configuration. Every field has a default matching the stock
/// deployment, so a partial JSON document (or none at all) yields a usable
/// bookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bookie_port: u16,
    pub journal_directory: PathBuf,
    pub ledger_directories: Vec<PathBuf>,
    /// Maximum size of an entry-log file in bytes before rolling.
    pub entry_log_size_limit: u64,
    /// Maximum journal file size in MiB before rolling.
    pub journal_max_size_mb: u64,
    /// Rolled journal files retained behind the checkpoint horizon.
    pub journal_max_backups: usize,
    pub flush_interval_ms: u64,
    pub gc_wait_time_ms: u64,
    /// Seconds between minor compaction passes; negative disables.
    pub minor_compaction_interval_secs: i64,
    pub minor_compaction_threshold: f64,
    /// Seconds between major compaction passes; negative disables.
    pub major_compaction_interval_secs: i64,
    pub major_compaction_threshold: f64,
    pub open_file_limit: usize,
    /// Resident index pages; <= 0 derives a bound from the page size.
    pub page_limit: i64,
    pub page_size: usize,
    /// Permits the disk checker to transition the node to read-only when a
    /// monitored filesystem crosses `disk_usage_threshold`.
    pub read_only_mode_enabled: bool,
    /// Starts the node read-only and keeps it there regardless of disk state.
    pub force_read_only: bool,
    pub disk_usage_threshold: f64,
    pub disk_usage_hysteresis: f64,
    pub disk_check_interval_ms: u64,
    pub zk_servers: Option<String>,
    pub zk_timeout_ms: u64,
    pub server_tcp_no_delay: bool,
    /// Cadence hint for the external auditor; not acted on locally.
    pub auditor_periodic_check_interval_secs: u64,
    /// Grace the external auditor gives an open ledger before re-replication.
    pub open_ledger_rereplication_grace_period_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bookie_port: 3181,
            journal_directory: PathBuf::from("/tmp/bk-txn"),
            ledger_directories: vec![PathBuf::from("/tmp/bk-data")],
            entry_log_size_limit: 2 * 1024 * 1024 * 1024,
            journal_max_size_mb: 2048,
            journal_max_backups: 5,
            flush_interval_ms: 100,
            gc_wait_time_ms: 1000,
            minor_compaction_interval_secs: 3600,
            minor_compaction_threshold: 0.2,
            major_compaction_interval_secs: 86400,
            major_compaction_threshold: 0.8,
            open_file_limit: 900,
            page_limit: -1,
            page_size: 8192,
            read_only_mode_enabled: true,
            force_read_only: false,
            disk_usage_threshold: 0.95,
            disk_usage_hysteresis: 0.05,
            disk_check_interval_ms: 10_000,
            zk_servers: None,
            zk_timeout_ms: 10_000,
            server_tcp_no_delay: true,
            auditor_periodic_check_interval_secs: 86400,
            open_ledger_rereplication_grace_period_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    /// Resident-page bound: the configured limit, or one derived so the page
    /// table stays near 32 MiB of slots.
    pub fn effective_page_limit(&self) -> usize {
        if self.page_limit > 0 {
            self.page_limit as usize
        } else {
            (32 * 1024 * 1024 / self.page_size).max(16)
        }
    }

    pub fn entries_per_page(&self) -> u64 {
        (self.page_size / 8) as u64
    }

    pub fn journal_max_size_bytes(&self) -> u64 {
        self.journal_max_size_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_directories.is_empty() {
            return Err(ConfigError::NoLedgerDirectories);
        }
        if self.page_size < 64 || self.page_size % 8 != 0 {
            return Err(ConfigError::InvalidPageSize {
                page_size: self.page_size,
            });
        }
        if !(0.0..=1.0).contains(&self.disk_usage_threshold) {
            return Err(ConfigError::InvalidThreshold {
                name: "disk_usage_threshold",
                value: self.disk_usage_threshold,
            });
        }
        // Entry offsets pack a 32-bit position within the log file; a larger
        // file limit would let positions wrap.
        if self.entry_log_size_limit > u32::MAX as u64 {
            return Err(ConfigError::EntryLogSizeLimitTooLarge {
                limit: self.entry_log_size_limit,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("at least one ledger directory is required")]
    NoLedgerDirectories,
    #[error("invalid page size {page_size} (must be a multiple of 8, at least 64)")]
    InvalidPageSize { page_size: usize },
    #[error("invalid value {value} for {name}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("entry_log_size_limit {limit} exceeds the 4 GiB position space")]
    EntryLogSizeLimitTooLarge { limit: u64 },
}
