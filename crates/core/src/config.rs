//! Immutable configuration snapshot.
//!
//! The daemon re-reads the router's key/value store at every round
//! boundary and builds one of these; the in-flight round keeps the
//! snapshot it started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Which listing sources a round walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Bookmarks,
    Following,
    Both,
}

impl ScanMode {
    pub fn includes_bookmarks(self) -> bool {
        matches!(self, ScanMode::Bookmarks | ScanMode::Both)
    }

    pub fn includes_following(self) -> bool {
        matches!(self, ScanMode::Following | ScanMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Bookmarks => "bookmarks",
            ScanMode::Following => "following",
            ScanMode::Both => "both",
        }
    }
}

/// Bookmark visibility scope passed to the listing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Restrict {
    Public,
    Private,
}

impl Restrict {
    pub fn as_str(self) -> &'static str {
        match self {
            Restrict::Public => "public",
            Restrict::Private => "private",
        }
    }
}

/// One round's worth of configuration, read once per round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub enabled: bool,
    pub user_id: u64,
    pub refresh_token: String,
    pub output_dir: PathBuf,
    pub mode: ScanMode,
    pub restrict: Restrict,
    /// Per-round download budget; 0 means unlimited.
    pub max_downloads: u32,
    pub timeout_secs: u64,
    pub sync_interval_minutes: u64,
    pub cooldown_after_limit_minutes: u64,
    pub cooldown_after_error_minutes: u64,
    pub high_speed_queue_size: u32,
    pub low_speed_interval_seconds: f64,
    pub interval_jitter_ms: u64,
}

fn parse_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl BackupConfig {
    /// Build a snapshot from the flattened key/value store.
    ///
    /// Unknown keys are ignored; malformed numeric values fall back to
    /// their defaults so a fat-fingered UCI edit cannot brick the daemon.
    pub fn from_kv(map: &HashMap<String, String>) -> Self {
        let mode = match map.get("mode").map(String::as_str) {
            Some("following") => ScanMode::Following,
            Some("both") => ScanMode::Both,
            _ => ScanMode::Bookmarks,
        };
        let restrict = match map.get("restrict").map(String::as_str) {
            Some("private") => Restrict::Private,
            _ => Restrict::Public,
        };
        let output_dir = map
            .get("output_dir")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/mnt/sda1/pixiv-backup"));

        Self {
            enabled: matches!(
                map.get("enabled").map(String::as_str),
                Some("1") | Some("true") | Some("yes") | Some("on")
            ),
            user_id: parse_or(map, "user_id", 0),
            refresh_token: map.get("refresh_token").cloned().unwrap_or_default(),
            output_dir,
            mode,
            restrict,
            max_downloads: parse_or(map, "max_downloads", 1000),
            timeout_secs: parse_or(map, "timeout", 30),
            sync_interval_minutes: parse_or(map, "sync_interval_minutes", 360),
            cooldown_after_limit_minutes: parse_or(map, "cooldown_after_limit_minutes", 60),
            cooldown_after_error_minutes: parse_or(map, "cooldown_after_error_minutes", 180),
            high_speed_queue_size: parse_or(map, "high_speed_queue_size", 20),
            low_speed_interval_seconds: parse_or(map, "low_speed_interval_seconds", 1.5),
            interval_jitter_ms: parse_or(map, "interval_jitter_ms", 500),
        }
    }

    /// Check the settings without which no round can run.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.user_id == 0 {
            missing.push("user_id");
        }
        if self.refresh_token.trim().is_empty() {
            missing.push("refresh_token");
        }
        if self.output_dir.as_os_str().is_empty() {
            missing.push("output_dir");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn img_dir(&self) -> PathBuf {
        self.output_dir.join("img")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.output_dir.join("metadata")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.output_dir.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("pixiv.db")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir().join("task_queue.json")
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir().join("scan_cursor.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir().join("status.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir().join("token.json")
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.data_dir().join("last_run.txt")
    }

    pub fn run_history_path(&self) -> PathBuf {
        self.data_dir().join("run_history.json")
    }

    pub fn force_flag_path(&self) -> PathBuf {
        self.data_dir().join("force_run.flag")
    }

    pub fn stop_flag_path(&self) -> PathBuf {
        self.data_dir().join("stop.flag")
    }

    pub fn img_dir_for(&self, illust_id: u64) -> PathBuf {
        self.img_dir().join(illust_id.to_string())
    }

    pub fn metadata_path_for(&self, illust_id: u64) -> PathBuf {
        self.metadata_dir().join(format!("{illust_id}.json"))
    }

    /// Create the output tree the round writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.img_dir(), self.metadata_dir(), self.log_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// True when `path` points somewhere we can actually create files.
pub fn dir_writable(path: &Path) -> bool {
    if std::fs::create_dir_all(path).is_err() {
        return false;
    }
    let probe = path.join(".write_probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
