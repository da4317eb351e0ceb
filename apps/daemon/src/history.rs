//! Round history appended to `data/run_history.json`.

use std::path::Path;

use chrono::{DateTime, Utc};
use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::{fsutil, Result};
use serde::{Deserialize, Serialize};

const HISTORY_KEPT: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: u64,
    pub hit_max_downloads: bool,
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigSummary {
    pub user_id: u64,
    pub mode: String,
    pub restrict: String,
    pub max_downloads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub stats: RunStats,
    pub elapsed_seconds: u64,
    pub config: RunConfigSummary,
}

impl RunRecord {
    pub fn new(stats: RunStats, elapsed_seconds: u64, config: &BackupConfig) -> Self {
        Self {
            timestamp: Utc::now(),
            stats,
            elapsed_seconds,
            config: RunConfigSummary {
                user_id: config.user_id,
                mode: config.mode.as_str().to_string(),
                restrict: config.restrict.as_str().to_string(),
                max_downloads: config.max_downloads,
            },
        }
    }
}

/// Append a record, keeping the most recent hundred.
pub fn append_run_record(path: &Path, record: RunRecord) -> Result<()> {
    let mut records: Vec<RunRecord> = match std::fs::read_to_string(path) {
        Ok(body) => serde_json::from_str(&body).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    records.push(record);
    if records.len() > HISTORY_KEPT {
        let excess = records.len() - HISTORY_KEPT;
        records.drain(..excess);
    }
    fsutil::write_json_atomic(path, &records)
}
