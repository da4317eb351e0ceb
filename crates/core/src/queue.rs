//! Durable task queue persisted as `task_queue.json`.
//!
//! Single-writer: the scheduler owns the only live instance. Mutations
//! mark the queue dirty; callers batch several mutations into one
//! `flush` per scheduler step to keep write amplification down on
//! flash storage.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::classify::{ErrorCategory, INVALID_FAILED_ROUNDS_LIMIT};
use crate::errors::{Error, Result};
use crate::fsutil;
use crate::illust::Illust;

const QUEUE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    PermanentFailed,
}

/// Structured failure attached to a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub message: String,
}

impl TaskError {
    pub fn new(category: ErrorCategory, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            category,
            http_status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub illust_id: u64,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Consecutive rounds this item has ended in `failed`; drives the
    /// permanent-fail threshold for invalid works.
    #[serde(default)]
    pub failed_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_bookmarked: bool,
    pub is_following_author: bool,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Trimmed copy of the upstream record so downloads can proceed
    /// without re-listing.
    pub illust: Illust,
}

/// What `enqueue` did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Inserted a fresh pending item.
    New,
    /// Existing terminal item was reset to pending.
    Reset,
    /// Existing item was updated in place without a status change.
    Refreshed,
    /// Item is permanently failed and stays that way.
    Skipped,
}

/// How a drained item ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success,
    /// All artifacts were already on disk.
    Skipped,
    Failed(TaskError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub done: usize,
    pub permanent_failed: usize,
}

#[derive(Serialize, Deserialize)]
struct QueueDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    items: Vec<QueueItem>,
}

pub struct TaskQueue {
    path: PathBuf,
    items: Vec<QueueItem>,
    dirty: bool,
}

impl TaskQueue {
    /// Load the queue document, or start empty when none exists yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                items: Vec::new(),
                dirty: false,
            });
        }
        let body = std::fs::read_to_string(&path)?;
        let doc: QueueDocument = serde_json::from_str(&body)
            .map_err(|e| Error::corrupt_state(path.display().to_string(), e.to_string()))?;
        Ok(Self {
            path,
            items: doc.items,
            dirty: false,
        })
    }

    /// Persist the queue if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let doc = QueueDocument {
            version: QUEUE_VERSION,
            updated_at: Utc::now(),
            items: self.items.clone(),
        };
        fsutil::write_json_atomic(&self.path, &doc)?;
        self.dirty = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, illust_id: u64) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.illust_id == illust_id)
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.items {
            match item.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::PermanentFailed => counts.permanent_failed += 1,
            }
        }
        counts
    }

    /// Items that would be claimable right now.
    pub fn eligible_count(&self, now: DateTime<Utc>) -> usize {
        self.items
            .iter()
            .filter(|i| claim_class(i, now).is_some())
            .count()
    }

    /// True when the given work already sits in a terminal state.
    pub fn is_terminal(&self, illust_id: u64) -> bool {
        matches!(
            self.get(illust_id).map(|i| i.status),
            Some(TaskStatus::Done) | Some(TaskStatus::PermanentFailed)
        )
    }

    /// Insert or update a candidate produced by the scanner.
    ///
    /// Items are unique by `illust_id`. Provenance flags merge with OR;
    /// a `running` item is never overwritten; a `failed` item is only
    /// pulled back to `pending` when a new provenance bit appears, so
    /// re-observation does not defeat backoff.
    pub fn enqueue(&mut self, mut illust: Illust, now: DateTime<Utc>) -> EnqueueOutcome {
        let Some(idx) = self.items.iter().position(|i| i.illust_id == illust.id) else {
            self.items.push(QueueItem {
                illust_id: illust.id,
                status: TaskStatus::Pending,
                retry_count: 0,
                failed_rounds: 0,
                last_error: None,
                next_retry_at: None,
                is_bookmarked: illust.is_bookmarked,
                is_following_author: illust.is_following_author,
                enqueued_at: now,
                updated_at: now,
                illust,
            });
            self.dirty = true;
            return EnqueueOutcome::New;
        };

        let item = &mut self.items[idx];
        let new_bookmark = illust.is_bookmarked && !item.is_bookmarked;
        let new_follow = illust.is_following_author && !item.is_following_author;
        item.is_bookmarked |= illust.is_bookmarked;
        item.is_following_author |= illust.is_following_author;

        illust.is_bookmarked = item.is_bookmarked;
        illust.is_following_author = item.is_following_author;
        if illust.bookmark_order.is_none() {
            illust.bookmark_order = item.illust.bookmark_order;
        }
        item.illust = illust;
        item.updated_at = now;
        self.dirty = true;

        match item.status {
            TaskStatus::Running | TaskStatus::Pending => EnqueueOutcome::Refreshed,
            TaskStatus::Done => {
                item.status = TaskStatus::Pending;
                item.next_retry_at = None;
                item.last_error = None;
                item.failed_rounds = 0;
                EnqueueOutcome::Reset
            }
            TaskStatus::Failed if new_bookmark || new_follow => {
                item.status = TaskStatus::Pending;
                item.next_retry_at = None;
                EnqueueOutcome::Reset
            }
            TaskStatus::Failed => EnqueueOutcome::Refreshed,
            TaskStatus::PermanentFailed => EnqueueOutcome::Skipped,
        }
    }

    /// Claim the next item for download, transitioning it to `running`.
    ///
    /// Pending items win over retry-eligible failed items; within a
    /// class, bookmark provenance wins over following, then FIFO by
    /// `enqueued_at`.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Option<QueueItem> {
        let idx = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                claim_class(item, now).map(|class| {
                    (
                        (class, !item.is_bookmarked, item.enqueued_at, item.illust_id),
                        idx,
                    )
                })
            })
            .min()
            .map(|(_, idx)| idx)?;

        let item = &mut self.items[idx];
        item.status = TaskStatus::Running;
        item.updated_at = now;
        self.dirty = true;
        Some(item.clone())
    }

    /// Record a drained item's outcome and schedule any retry.
    pub fn complete(&mut self, illust_id: u64, outcome: TaskOutcome, now: DateTime<Utc>) {
        let Some(item) = self.items.iter_mut().find(|i| i.illust_id == illust_id) else {
            return;
        };
        item.updated_at = now;
        self.dirty = true;

        match outcome {
            TaskOutcome::Success | TaskOutcome::Skipped => {
                item.status = TaskStatus::Done;
                item.last_error = None;
                item.next_retry_at = None;
                item.failed_rounds = 0;
            }
            TaskOutcome::Failed(err) => match err.category {
                ErrorCategory::Invalid => {
                    item.failed_rounds += 1;
                    item.last_error = Some(err);
                    item.next_retry_at = None;
                    item.status = if item.failed_rounds >= INVALID_FAILED_ROUNDS_LIMIT {
                        TaskStatus::PermanentFailed
                    } else {
                        TaskStatus::Failed
                    };
                }
                ErrorCategory::Auth => {
                    // Round-fatal upstream; the item itself is blameless
                    // and goes back to pending for the next round.
                    item.status = TaskStatus::Pending;
                    item.last_error = Some(err);
                    item.next_retry_at = None;
                }
                category => {
                    item.retry_count += 1;
                    item.failed_rounds += 1;
                    let policy = category
                        .retry_policy()
                        .expect("retryable category has a policy");
                    if item.retry_count > policy.max_retries {
                        item.status = TaskStatus::PermanentFailed;
                        item.next_retry_at = None;
                    } else {
                        item.status = TaskStatus::Failed;
                        let backoff = category.backoff_secs(item.retry_count);
                        item.next_retry_at = Some(now + ChronoDuration::seconds(backoff as i64));
                    }
                    item.last_error = Some(err);
                }
            },
        }
    }

    /// Put any `running` items back to `pending`.
    ///
    /// Called at startup (a crash mid-download must not strand items)
    /// and on graceful stop.
    pub fn release_running(&mut self, now: DateTime<Utc>) -> usize {
        let mut released = 0;
        for item in &mut self.items {
            if item.status == TaskStatus::Running {
                item.status = TaskStatus::Pending;
                item.updated_at = now;
                released += 1;
            }
        }
        if released > 0 {
            self.dirty = true;
        }
        released
    }

    /// Drop `done` items older than `days`.
    pub fn purge_done(&mut self, now: DateTime<Utc>, days: i64) -> usize {
        let horizon = now - ChronoDuration::days(days);
        let before = self.items.len();
        self.items
            .retain(|i| !(i.status == TaskStatus::Done && i.updated_at < horizon));
        let purged = before - self.items.len();
        if purged > 0 {
            self.dirty = true;
        }
        purged
    }
}

fn claim_class(item: &QueueItem, now: DateTime<Utc>) -> Option<u8> {
    match item.status {
        TaskStatus::Pending => Some(0),
        TaskStatus::Failed if item.next_retry_at.map_or(true, |t| t <= now) => Some(1),
        _ => None,
    }
}

/// Inter-claim delay for the two-tier pacing scheme.
///
/// The first `high_speed_queue_size` claims of a round go immediately;
/// later ones wait `low_speed_interval_seconds` plus a random jitter in
/// `[0, interval_jitter_ms]`.
pub fn claim_delay(
    claims_so_far: u32,
    high_speed_queue_size: u32,
    low_speed_interval_seconds: f64,
    interval_jitter_ms: u64,
) -> std::time::Duration {
    if claims_so_far < high_speed_queue_size {
        return std::time::Duration::ZERO;
    }
    let base_ms = (low_speed_interval_seconds.max(0.0) * 1000.0) as u64;
    let jitter_ms = if interval_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=interval_jitter_ms)
    } else {
        0
    };
    std::time::Duration::from_millis(base_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn illust(id: u64, bookmarked: bool, following: bool) -> Illust {
        let mut value: Illust = serde_json::from_value(serde_json::json!({
            "id": id,
            "title": format!("work {id}"),
            "user": {"id": 1, "name": "n", "account": "a"},
            "create_date": "2026-07-01T00:00:00+09:00",
            "page_count": 1
        }))
        .unwrap();
        value.is_bookmarked = bookmarked;
        value.is_following_author = following;
        value
    }

    fn queue() -> (TaskQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let q = TaskQueue::load(dir.path().join("task_queue.json")).unwrap();
        (q, dir)
    }

    #[test]
    fn enqueue_is_unique_by_illust_id() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        assert_eq!(q.enqueue(illust(1, true, false), now), EnqueueOutcome::New);
        assert_eq!(
            q.enqueue(illust(1, false, true), now),
            EnqueueOutcome::Refreshed
        );
        assert_eq!(q.len(), 1);
        let item = q.get(1).unwrap();
        assert!(item.is_bookmarked && item.is_following_author);
        assert!(item.illust.is_bookmarked && item.illust.is_following_author);
    }

    #[test]
    fn enqueue_never_overwrites_running() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);
        q.claim_next(now).unwrap();
        assert_eq!(
            q.enqueue(illust(1, true, true), now),
            EnqueueOutcome::Refreshed
        );
        assert_eq!(q.get(1).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn claim_prefers_pending_then_bookmarks_then_fifo() {
        let (mut q, _dir) = queue();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);
        let t2 = t0 + ChronoDuration::seconds(2);
        q.enqueue(illust(10, false, true), t0);
        q.enqueue(illust(11, true, false), t1);
        q.enqueue(illust(12, true, false), t2);

        // A failed-but-eligible item must not outrank pending ones.
        q.enqueue(illust(13, true, false), t0);
        assert_eq!(q.claim_next(t0).unwrap().illust_id, 13);
        q.complete(
            13,
            TaskOutcome::Failed(TaskError::new(ErrorCategory::Network, None, "conn reset")),
            t0,
        );

        let now = t2 + ChronoDuration::seconds(3600);
        assert_eq!(q.claim_next(now).unwrap().illust_id, 11);
        assert_eq!(q.claim_next(now).unwrap().illust_id, 12);
        assert_eq!(q.claim_next(now).unwrap().illust_id, 10);
        assert_eq!(q.claim_next(now).unwrap().illust_id, 13);
        assert!(q.claim_next(now).is_none());
    }

    #[test]
    fn failed_item_waits_for_next_retry_at() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);
        q.claim_next(now).unwrap();
        q.complete(
            1,
            TaskOutcome::Failed(TaskError::new(ErrorCategory::RateLimit, Some(429), "429")),
            now,
        );

        let item = q.get(1).unwrap();
        assert_eq!(item.status, TaskStatus::Failed);
        let eta = item.next_retry_at.unwrap();
        assert!(eta - now >= ChronoDuration::seconds(300));

        assert!(q.claim_next(now + ChronoDuration::seconds(299)).is_none());
        assert!(q.claim_next(eta).is_some());
    }

    #[test]
    fn backoff_grows_per_retry_and_caps_out() {
        let (mut q, _dir) = queue();
        let mut now = Utc::now();
        q.enqueue(illust(1, true, false), now);

        let mut previous = ChronoDuration::zero();
        for _ in 0..4 {
            now = q.get(1).unwrap().next_retry_at.unwrap_or(now);
            q.claim_next(now).unwrap();
            q.complete(
                1,
                TaskOutcome::Failed(TaskError::new(ErrorCategory::Network, None, "timeout")),
                now,
            );
            let item = q.get(1).unwrap();
            let wait = item.next_retry_at.unwrap() - now;
            assert!(
                wait >= ChronoDuration::seconds(
                    ErrorCategory::Network.backoff_secs(item.retry_count) as i64
                )
            );
            assert!(wait >= previous);
            previous = wait;
        }
    }

    #[test]
    fn retry_cap_transitions_to_permanent_failed() {
        let (mut q, _dir) = queue();
        let mut now = Utc::now();
        q.enqueue(illust(1, true, false), now);

        let cap = ErrorCategory::Unknown.retry_policy().unwrap().max_retries;
        for _ in 0..=cap {
            now = q
                .get(1)
                .unwrap()
                .next_retry_at
                .map(|t| t + ChronoDuration::seconds(1))
                .unwrap_or(now);
            q.claim_next(now).expect("item should stay claimable");
            q.complete(
                1,
                TaskOutcome::Failed(TaskError::new(ErrorCategory::Unknown, Some(418), "odd")),
                now,
            );
        }
        let item = q.get(1).unwrap();
        assert_eq!(item.status, TaskStatus::PermanentFailed);
        assert_eq!(item.retry_count, cap + 1);
        assert!(q.claim_next(now + ChronoDuration::days(365)).is_none());
    }

    #[test]
    fn invalid_becomes_permanent_after_three_failed_rounds() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);

        for round in 1..=3u32 {
            q.claim_next(now).unwrap();
            q.complete(
                1,
                TaskOutcome::Failed(TaskError::new(ErrorCategory::Invalid, Some(404), "gone")),
                now,
            );
            let item = q.get(1).unwrap();
            assert_eq!(item.failed_rounds, round);
            if round < 3 {
                assert_eq!(item.status, TaskStatus::Failed);
                assert!(item.next_retry_at.is_none(), "eligible again next round");
            } else {
                assert_eq!(item.status, TaskStatus::PermanentFailed);
            }
        }
        // Re-observation of a permanently failed work never revives it.
        assert_eq!(q.enqueue(illust(1, true, true), now), EnqueueOutcome::Skipped);
    }

    #[test]
    fn auth_failure_returns_item_to_pending() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);
        q.claim_next(now).unwrap();
        q.complete(
            1,
            TaskOutcome::Failed(TaskError::new(ErrorCategory::Auth, Some(401), "expired")),
            now,
        );
        let item = q.get(1).unwrap();
        assert_eq!(item.status, TaskStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn new_provenance_resets_failed_items_but_plain_rescan_does_not() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);
        q.claim_next(now).unwrap();
        q.complete(
            1,
            TaskOutcome::Failed(TaskError::new(ErrorCategory::Network, None, "eof")),
            now,
        );

        assert_eq!(
            q.enqueue(illust(1, true, false), now),
            EnqueueOutcome::Refreshed
        );
        assert_eq!(q.get(1).unwrap().status, TaskStatus::Failed);

        assert_eq!(q.enqueue(illust(1, false, true), now), EnqueueOutcome::Reset);
        let item = q.get(1).unwrap();
        assert_eq!(item.status, TaskStatus::Pending);
        assert_eq!(item.retry_count, 1, "retry_count never decreases");
    }

    #[test]
    fn release_running_and_purge_done() {
        let (mut q, _dir) = queue();
        let now = Utc::now();
        q.enqueue(illust(1, true, false), now);
        q.enqueue(illust(2, true, false), now);
        q.claim_next(now).unwrap();
        assert_eq!(q.release_running(now), 1);
        assert_eq!(q.counts().pending, 2);

        q.claim_next(now).unwrap();
        q.complete(1, TaskOutcome::Success, now - ChronoDuration::days(10));
        assert_eq!(q.purge_done(now, 7), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn queue_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task_queue.json");
        let now = Utc::now();

        let mut q = TaskQueue::load(&path).unwrap();
        q.enqueue(illust(5, true, false), now);
        q.claim_next(now).unwrap();
        q.complete(
            5,
            TaskOutcome::Failed(TaskError::new(ErrorCategory::RateLimit, Some(429), "slow down")),
            now,
        );
        q.flush().unwrap();

        let q2 = TaskQueue::load(&path).unwrap();
        let item = q2.get(5).unwrap();
        assert_eq!(item.status, TaskStatus::Failed);
        assert_eq!(item.last_error.as_ref().unwrap().category, ErrorCategory::RateLimit);
        assert_eq!(item.retry_count, 1);
        assert!(item.next_retry_at.is_some());
    }

    #[test]
    fn corrupt_queue_file_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task_queue.json");
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(
            TaskQueue::load(&path),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn claim_delay_is_zero_in_high_speed_phase() {
        assert_eq!(
            claim_delay(0, 20, 1.5, 0),
            std::time::Duration::ZERO
        );
        assert_eq!(
            claim_delay(19, 20, 1.5, 0),
            std::time::Duration::ZERO
        );
        let slow = claim_delay(20, 20, 1.5, 0);
        assert_eq!(slow, std::time::Duration::from_millis(1500));
        let jittered = claim_delay(20, 20, 1.5, 250);
        assert!(jittered >= slow && jittered <= slow + std::time::Duration::from_millis(250));
    }
}
