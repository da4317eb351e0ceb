//! Per-source scan watermarks persisted as `scan_cursor.json`.
//!
//! Cursors only advance at the end of a successful scan pass, after
//! every covered work has been enqueued or deliberately skipped.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::fsutil;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmarksCursor {
    pub latest_seen_illust_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_seen_create_date: Option<String>,
    /// When set, the next bookmarks pass walks the full list and the
    /// consecutive-known early stop is disabled.
    pub full_scan: bool,
    /// Whether the last incremental pass ended on the early-stop rule
    /// rather than list exhaustion.
    pub incremental_stopped: bool,
}

impl Default for BookmarksCursor {
    fn default() -> Self {
        // First run is always a full walk.
        Self {
            latest_seen_illust_id: 0,
            latest_seen_create_date: None,
            full_scan: true,
            incremental_stopped: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorCursor {
    pub latest_seen_illust_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_seen_create_date: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanCursors {
    #[serde(default)]
    pub bookmarks: BookmarksCursor,
    /// Per-author watermark for the following scan, keyed by author id.
    #[serde(default)]
    pub following: BTreeMap<u64, AuthorCursor>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScanCursors {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path)?;
        serde_json::from_str(&body)
            .map_err(|e| Error::corrupt_state(path.display().to_string(), e.to_string()))
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());
        fsutil::write_json_atomic(path, self)
    }

    /// Advance the bookmarks watermark; it never moves backwards unless
    /// a full scan was deliberately requested.
    pub fn advance_bookmarks(&mut self, illust_id: u64, create_date: Option<&str>) {
        if illust_id > self.bookmarks.latest_seen_illust_id {
            self.bookmarks.latest_seen_illust_id = illust_id;
            self.bookmarks.latest_seen_create_date = create_date.map(str::to_owned);
        }
    }

    pub fn author(&self, author_id: u64) -> Option<&AuthorCursor> {
        self.following.get(&author_id)
    }

    pub fn advance_author(
        &mut self,
        author_id: u64,
        illust_id: u64,
        create_date: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let cursor = self.following.entry(author_id).or_default();
        if illust_id > cursor.latest_seen_illust_id {
            cursor.latest_seen_illust_id = illust_id;
            cursor.latest_seen_create_date = create_date.map(str::to_owned);
        }
        cursor.updated_at = now;
    }

    /// Drop an author's watermark so the next scan walks their list in
    /// full (used after an ordering anomaly).
    pub fn reset_author(&mut self, author_id: u64) {
        self.following.remove(&author_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_defaults_to_full_scan() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = ScanCursors::load(&dir.path().join("scan_cursor.json")).unwrap();
        assert!(cursors.bookmarks.full_scan);
        assert_eq!(cursors.bookmarks.latest_seen_illust_id, 0);
        assert!(cursors.following.is_empty());
    }

    #[test]
    fn bookmarks_watermark_is_monotonic() {
        let mut cursors = ScanCursors::default();
        cursors.advance_bookmarks(100, Some("2026-07-01T00:00:00+09:00"));
        cursors.advance_bookmarks(50, Some("2026-06-01T00:00:00+09:00"));
        assert_eq!(cursors.bookmarks.latest_seen_illust_id, 100);
        assert_eq!(
            cursors.bookmarks.latest_seen_create_date.as_deref(),
            Some("2026-07-01T00:00:00+09:00")
        );
    }

    #[test]
    fn author_cursors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_cursor.json");
        let now = Utc::now();

        let mut cursors = ScanCursors::default();
        cursors.advance_author(9, 777, Some("2026-05-01T00:00:00+09:00"), now);
        cursors.bookmarks.full_scan = false;
        cursors.save(&path).unwrap();

        let loaded = ScanCursors::load(&path).unwrap();
        assert_eq!(loaded.author(9).unwrap().latest_seen_illust_id, 777);
        assert!(!loaded.bookmarks.full_scan);

        let mut loaded = loaded;
        loaded.reset_author(9);
        assert!(loaded.author(9).is_none());
    }
}
