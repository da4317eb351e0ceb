//! Runtime status snapshot published as `status.json`.
//!
//! The status file is the sole fan-out channel to observers (LuCI, the
//! `status` subcommand); readers never touch the live queue. Writes are
//! atomic and strictly monotonic in `updated_at`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::fsutil;
use crate::queue::QueueCounts;

/// Coarse daemon state surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Syncing,
    Cooldown,
    Stopped,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Idle => "idle",
            ServiceState::Syncing => "syncing",
            ServiceState::Cooldown => "cooldown",
            ServiceState::Stopped => "stopped",
        }
    }
}

/// Why the daemon is cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    RateLimit,
    Error,
    Limit,
}

/// Structured error surfaced in `last_error` and `recent_errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illust_id: Option<u64>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub error: String,
}

const RECENT_ERRORS_KEPT: usize = 10;

/// The published document. Incremental fields are optional; readers
/// treat absence as unknown, not zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub processed_total: u64,
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub hit_max_downloads: bool,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_errors: Vec<StatusError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_reason: Option<CooldownReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeStatus {
    pub fn new(state: ServiceState) -> Self {
        Self {
            state,
            phase: None,
            message: None,
            processed_total: 0,
            success: 0,
            skipped: 0,
            failed: 0,
            hit_max_downloads: false,
            rate_limited: false,
            last_error: None,
            recent_errors: Vec::new(),
            queue: None,
            cooldown_reason: None,
            next_run_at: None,
            cooldown_seconds: None,
            updated_at: Utc::now(),
        }
    }

    /// Record an error, keeping the most recent ten.
    pub fn push_error(&mut self, err: StatusError) {
        self.last_error = Some(err.clone());
        self.recent_errors.push(err);
        if self.recent_errors.len() > RECENT_ERRORS_KEPT {
            let excess = self.recent_errors.len() - RECENT_ERRORS_KEPT;
            self.recent_errors.drain(..excess);
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)?;
        serde_json::from_str(&body)
            .map_err(|e| Error::corrupt_state(path.display().to_string(), e.to_string()))
    }
}

/// Owns the atomic, monotonic publication of `status.json`.
pub struct StatusPublisher {
    path: PathBuf,
    last_published_at: Option<DateTime<Utc>>,
}

impl StatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_published_at: None,
        }
    }

    /// Stamp a monotonic `updated_at` and write the document atomically.
    pub fn publish(&mut self, status: &mut RuntimeStatus) -> Result<()> {
        let mut now = Utc::now();
        if let Some(last) = self.last_published_at {
            if now <= last {
                now = last + ChronoDuration::milliseconds(1);
            }
        }
        status.updated_at = now;
        fsutil::write_json_atomic(&self.path, status)?;
        self.last_published_at = Some(now);
        Ok(())
    }
}
