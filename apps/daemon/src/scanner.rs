//! Incremental scanner over the bookmarks and following listing sources.
//!
//! The scanner walks pages, decides per work whether to enqueue, and
//! only advances the scan cursors once everything a pass covered has
//! been enqueued or deliberately skipped.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pixiv_backup_api::error::Result as ApiResult;
use pixiv_backup_api::types::{IllustPage, UserPreviewPage};
use pixiv_backup_api::{ApiError, PixivClient};
use pixiv_backup_core::audit_event;
use pixiv_backup_core::classify::ErrorCategory;
use pixiv_backup_core::config::{BackupConfig, Restrict};
use pixiv_backup_core::cursor::ScanCursors;
use pixiv_backup_core::illust::Illust;
use pixiv_backup_core::queue::{EnqueueOutcome, TaskQueue};
use pixiv_backup_core::status::StatusError;
use pixiv_backup_core::Result;
use pixiv_backup_storage_sqlite::MetadataRepository;

/// Consecutive already-known observations after which an incremental
/// bookmarks pass stops.
pub const CONSECUTIVE_KNOWN_STOP: u32 = 50;

/// Listing seam, so tests can drive the scanner with scripted pages.
#[async_trait]
pub trait IllustSource: Send + Sync {
    async fn bookmarks_page(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> ApiResult<IllustPage>;

    async fn following_page(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> ApiResult<UserPreviewPage>;

    async fn author_illusts_page(
        &self,
        author_id: u64,
        next_url: Option<&str>,
    ) -> ApiResult<IllustPage>;
}

#[async_trait]
impl IllustSource for PixivClient {
    async fn bookmarks_page(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> ApiResult<IllustPage> {
        self.user_bookmarks(user_id, restrict, next_url).await
    }

    async fn following_page(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> ApiResult<UserPreviewPage> {
        self.user_following(user_id, restrict, next_url).await
    }

    async fn author_illusts_page(
        &self,
        author_id: u64,
        next_url: Option<&str>,
    ) -> ApiResult<IllustPage> {
        self.user_illusts(author_id, next_url).await
    }
}

/// What a scan pass observed.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub scanned: u64,
    pub enqueued: u64,
    pub known: u64,
    pub limited: u64,
    pub rate_limited: bool,
    pub auth_fatal: bool,
    pub hit_admission_limit: bool,
    /// The round's wall-clock deadline passed mid-scan.
    pub deadline_exceeded: bool,
    pub last_error: Option<StatusError>,
}

impl ScanOutcome {
    pub fn merge(&mut self, other: ScanOutcome) {
        self.scanned += other.scanned;
        self.enqueued += other.enqueued;
        self.known += other.known;
        self.limited += other.limited;
        self.rate_limited |= other.rate_limited;
        self.auth_fatal |= other.auth_fatal;
        self.hit_admission_limit |= other.hit_admission_limit;
        self.deadline_exceeded |= other.deadline_exceeded;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }
}

enum Walked {
    Candidate(Box<Illust>),
    Known { id: u64, create_date: String },
    Limited { id: u64, create_date: String },
}

impl Walked {
    fn id(&self) -> u64 {
        match self {
            Walked::Candidate(illust) => illust.id,
            Walked::Known { id, .. } | Walked::Limited { id, .. } => *id,
        }
    }

    fn create_date(&self) -> &str {
        match self {
            Walked::Candidate(illust) => &illust.create_date,
            Walked::Known { create_date, .. } | Walked::Limited { create_date, .. } => create_date,
        }
    }
}

pub struct Scanner<'a, S: IllustSource> {
    source: &'a S,
    repo: &'a MetadataRepository,
    config: &'a BackupConfig,
    cancel: &'a CancellationToken,
    /// The round's wall-clock cap; page walks stop once it passes.
    deadline: Instant,
}

impl<'a, S: IllustSource> Scanner<'a, S> {
    pub fn new(
        source: &'a S,
        repo: &'a MetadataRepository,
        config: &'a BackupConfig,
        cancel: &'a CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            source,
            repo,
            config,
            cancel,
            deadline,
        }
    }

    fn admission_reached(&self, queued_or_buffered: usize) -> bool {
        self.config.max_downloads > 0 && queued_or_buffered >= self.config.max_downloads as usize
    }

    fn round_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn record_error(&self, outcome: &mut ScanOutcome, action: &str, err: &ApiError) {
        match err.category() {
            ErrorCategory::RateLimit => outcome.rate_limited = true,
            ErrorCategory::Auth => outcome.auth_fatal = true,
            _ => {}
        }
        warn!(action, error = %err, "scan request failed");
        audit_event!("scan_error", action = action, error = err);
        outcome.last_error = Some(StatusError {
            time: Utc::now(),
            illust_id: None,
            action: action.to_string(),
            url: None,
            error: err.to_string(),
        });
    }

    /// True when the work needs no further attention this round.
    fn is_known(&self, queue: &TaskQueue, illust_id: u64) -> Result<bool> {
        Ok(self.repo.is_downloaded(illust_id)?
            || queue.is_terminal(illust_id)
            || self.repo.is_access_limited(illust_id)?)
    }

    /// Walk the bookmarks listing (newest-added first).
    pub async fn scan_bookmarks(
        &self,
        queue: &mut TaskQueue,
        cursors: &mut ScanCursors,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let full_scan = cursors.bookmarks.full_scan;
        audit_event!(
            "scan_start",
            source = "bookmarks",
            user_id = self.config.user_id,
            full_scan = full_scan
        );

        let mut walked: Vec<Walked> = Vec::new();
        let mut candidates = 0usize;
        let mut consecutive_known = 0u32;
        let mut incremental_stopped = false;
        let mut aborted = false;
        let mut list_exhausted = false;
        // New works at the very top of the list are the only ones that
        // receive a bookmark_order during an incremental pass.
        let mut top_is_all_new = true;
        let mut top_new = 0usize;
        let mut next_url: Option<String> = None;

        'pages: loop {
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }
            if self.round_expired() {
                warn!("round wall-clock cap reached during bookmarks scan");
                outcome.deadline_exceeded = true;
                aborted = true;
                break;
            }
            let page = match self
                .source
                .bookmarks_page(self.config.user_id, self.config.restrict, next_url.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.record_error(&mut outcome, "scan_bookmarks", &err);
                    aborted = true;
                    break;
                }
            };
            audit_event!(
                "scan_page",
                source = "bookmarks",
                page_size = page.illusts.len(),
                has_next = page.next_url.is_some()
            );

            for illust in page.illusts {
                outcome.scanned += 1;
                if self.is_known(queue, illust.id)? {
                    outcome.known += 1;
                    consecutive_known += 1;
                    top_is_all_new = false;
                    walked.push(Walked::Known {
                        id: illust.id,
                        create_date: illust.create_date,
                    });
                    if !full_scan && consecutive_known >= CONSECUTIVE_KNOWN_STOP {
                        incremental_stopped = true;
                        info!(
                            consecutive_known,
                            "bookmarks scan stopping early on known run"
                        );
                        break 'pages;
                    }
                    continue;
                }
                consecutive_known = 0;
                if illust.is_access_limited() {
                    self.repo.save_illust(&illust)?;
                    self.repo.mark_limited(illust.id)?;
                    outcome.limited += 1;
                    top_is_all_new = false;
                    audit_event!("scan_limited", source = "bookmarks", illust_id = illust.id);
                    walked.push(Walked::Limited {
                        id: illust.id,
                        create_date: illust.create_date,
                    });
                    continue;
                }
                if top_is_all_new {
                    top_new += 1;
                }
                candidates += 1;
                walked.push(Walked::Candidate(Box::new(illust)));
                if !full_scan && self.admission_reached(queue.counts().pending + candidates) {
                    outcome.hit_admission_limit = true;
                    break 'pages;
                }
            }

            next_url = page.next_url;
            if next_url.is_none() {
                list_exhausted = true;
                break;
            }
        }

        // Order assignment. A full walk is authoritative for every
        // observed position; an incremental pass only numbers the new
        // run at the top, continuing from the stored maximum.
        let assign_full = full_scan && list_exhausted && !aborted;
        if assign_full {
            let total = walked.len() as i64;
            for (i, entry) in walked.iter_mut().enumerate() {
                let order = total - 1 - i as i64;
                match entry {
                    Walked::Candidate(illust) => illust.bookmark_order = Some(order as u64),
                    Walked::Known { id, .. } | Walked::Limited { id, .. } => {
                        self.repo.set_bookmark_order(*id, order)?;
                    }
                }
            }
        } else if top_new > 0 && !aborted {
            let base = self.repo.max_bookmark_order()?.unwrap_or(-1);
            let k = top_new as i64;
            let mut i = 0i64;
            for entry in walked.iter_mut().take(top_new) {
                if let Walked::Candidate(illust) = entry {
                    illust.bookmark_order = Some((base + k - i) as u64);
                    i += 1;
                }
            }
        }

        // Enqueue, then advance the cursor over what was processed. The
        // cursor never covers a candidate the admission limit kept out.
        let now = Utc::now();
        let mut watermark: Option<(u64, String)> = None;
        let mut enqueue_truncated = false;
        for entry in walked {
            if matches!(entry, Walked::Candidate(_))
                && self.admission_reached(queue.counts().pending)
            {
                outcome.hit_admission_limit = true;
                enqueue_truncated = true;
                break;
            }
            if watermark.as_ref().map_or(true, |(id, _)| entry.id() > *id) {
                watermark = Some((entry.id(), entry.create_date().to_string()));
            }
            if let Walked::Candidate(mut illust) = entry {
                illust.is_bookmarked = true;
                illust.is_following_author = false;
                match queue.enqueue(*illust, now) {
                    EnqueueOutcome::New | EnqueueOutcome::Reset => {
                        outcome.enqueued += 1;
                    }
                    EnqueueOutcome::Refreshed | EnqueueOutcome::Skipped => {}
                }
            }
        }

        if !aborted {
            if let Some((id, date)) = watermark {
                cursors.advance_bookmarks(id, Some(&date));
            }
            cursors.bookmarks.incremental_stopped = incremental_stopped;
            // A full walk interrupted by the admission limit stays a
            // full walk so the next round can finish the job.
            if assign_full && !enqueue_truncated {
                cursors.bookmarks.full_scan = false;
            }
        }

        audit_event!(
            "scan_finish",
            source = "bookmarks",
            scanned = outcome.scanned,
            enqueued = outcome.enqueued,
            known = outcome.known,
            limited = outcome.limited,
            rate_limited = outcome.rate_limited,
            incremental_stopped = incremental_stopped
        );
        Ok(outcome)
    }

    /// Walk followed authors and their work lists.
    pub async fn scan_following(
        &self,
        queue: &mut TaskQueue,
        cursors: &mut ScanCursors,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        audit_event!(
            "scan_start",
            source = "following",
            user_id = self.config.user_id
        );

        // Load the follow list one page at a time.
        let mut authors: Vec<u64> = Vec::new();
        let mut next_url: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(outcome);
            }
            if self.round_expired() {
                warn!("round wall-clock cap reached while listing followed authors");
                outcome.deadline_exceeded = true;
                return Ok(outcome);
            }
            let page = match self
                .source
                .following_page(self.config.user_id, self.config.restrict, next_url.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.record_error(&mut outcome, "scan_following_users", &err);
                    return Ok(outcome);
                }
            };
            authors.extend(page.user_previews.iter().map(|p| p.user.id));
            next_url = page.next_url;
            if next_url.is_none() {
                break;
            }
        }
        audit_event!("following_users_loaded", user_count = authors.len());

        for author_id in authors {
            if self.cancel.is_cancelled()
                || outcome.rate_limited
                || outcome.auth_fatal
                || outcome.deadline_exceeded
            {
                break;
            }
            if self.round_expired() {
                warn!("round wall-clock cap reached during following scan");
                outcome.deadline_exceeded = true;
                break;
            }
            if self.admission_reached(queue.counts().pending) {
                outcome.hit_admission_limit = true;
                break;
            }
            let author_outcome = self.scan_author(queue, cursors, author_id).await?;
            outcome.merge(author_outcome);
        }

        audit_event!(
            "scan_finish",
            source = "following",
            scanned = outcome.scanned,
            enqueued = outcome.enqueued,
            known = outcome.known,
            limited = outcome.limited,
            rate_limited = outcome.rate_limited
        );
        Ok(outcome)
    }

    async fn scan_author(
        &self,
        queue: &mut TaskQueue,
        cursors: &mut ScanCursors,
        author_id: u64,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let cursor = cursors.author(author_id).cloned();
        let mut anomaly = false;
        let mut aborted = false;
        let mut watermark: Option<(u64, String)> = None;
        let now = Utc::now();
        let mut next_url: Option<String> = None;

        'pages: loop {
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }
            if self.round_expired() {
                outcome.deadline_exceeded = true;
                aborted = true;
                break;
            }
            let page = match self
                .source
                .author_illusts_page(author_id, next_url.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.record_error(&mut outcome, "scan_following_illusts", &err);
                    aborted = true;
                    break;
                }
            };
            audit_event!(
                "scan_page",
                source = "following",
                author_id = author_id,
                page_size = page.illusts.len()
            );

            let mut prev_id: Option<u64> = None;
            for illust in page.illusts {
                outcome.scanned += 1;

                // Pages list newest first; a work newer than one that
                // appeared before it means the ordering the cursor
                // relies on does not hold for this author.
                if let Some(prev) = prev_id {
                    if illust.id > prev && !anomaly {
                        anomaly = true;
                        warn!(
                            author_id,
                            earlier = prev,
                            later = illust.id,
                            "ordering anomaly in author listing, discarding cursor"
                        );
                        audit_event!(
                            "scan_order_anomaly",
                            author_id = author_id,
                            earlier_illust_id = prev,
                            later_illust_id = illust.id
                        );
                    }
                }
                prev_id = Some(illust.id);

                if let (Some(cursor), false) = (&cursor, anomaly) {
                    let older_id = illust.id <= cursor.latest_seen_illust_id;
                    let older_date = match (
                        illust.create_date_parsed(),
                        cursor
                            .latest_seen_create_date
                            .as_deref()
                            .and_then(|d| chrono::DateTime::parse_from_rfc3339(d).ok()),
                    ) {
                        (Some(current), Some(seen)) => current <= seen,
                        _ => true,
                    };
                    if older_id && older_date {
                        break 'pages;
                    }
                }

                if watermark.as_ref().map_or(true, |(id, _)| illust.id > *id) {
                    watermark = Some((illust.id, illust.create_date.clone()));
                }

                if self.is_known(queue, illust.id)? {
                    outcome.known += 1;
                    continue;
                }
                if illust.is_access_limited() {
                    self.repo.save_illust(&illust)?;
                    self.repo.mark_limited(illust.id)?;
                    outcome.limited += 1;
                    audit_event!(
                        "scan_limited",
                        source = "following",
                        illust_id = illust.id
                    );
                    continue;
                }

                let mut illust = illust;
                illust.is_following_author = true;
                match queue.enqueue(illust, now) {
                    EnqueueOutcome::New | EnqueueOutcome::Reset => outcome.enqueued += 1,
                    EnqueueOutcome::Refreshed | EnqueueOutcome::Skipped => {}
                }
                if self.admission_reached(queue.counts().pending) {
                    outcome.hit_admission_limit = true;
                    break 'pages;
                }
            }

            next_url = page.next_url;
            if next_url.is_none() {
                break;
            }
        }

        if anomaly {
            cursors.reset_author(author_id);
        } else if !aborted {
            if let Some((id, date)) = watermark {
                cursors.advance_author(author_id, id, Some(&date), now);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixiv_backup_api::types::UserPreview;
    use pixiv_backup_core::illust::IllustUser;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    fn mk_illust(id: u64, create_date: &str) -> Illust {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "title": format!("work {id}"),
            "user": {"id": 660, "name": "author", "account": "acct"},
            "create_date": create_date,
            "page_count": 1,
            "meta_single_page": {"original_image_url": format!("https://i.pximg.net/{id}.png")}
        }))
        .unwrap()
    }

    fn mk_limited(id: u64) -> Illust {
        let mut illust = mk_illust(id, "2026-07-01T00:00:00+09:00");
        illust.visible = false;
        illust
    }

    type PageScript = std::result::Result<(Vec<Illust>, bool), u16>;

    #[derive(Default)]
    struct FakeSource {
        bookmarks: Mutex<VecDeque<PageScript>>,
        following: Mutex<VecDeque<Vec<u64>>>,
        author_pages: Mutex<HashMap<u64, VecDeque<PageScript>>>,
    }

    impl FakeSource {
        fn with_bookmarks(pages: Vec<PageScript>) -> Self {
            Self {
                bookmarks: Mutex::new(pages.into()),
                ..Default::default()
            }
        }

        fn with_authors(authors: Vec<u64>, pages: HashMap<u64, VecDeque<PageScript>>) -> Self {
            Self {
                following: Mutex::new(VecDeque::from([authors])),
                author_pages: Mutex::new(pages),
                ..Default::default()
            }
        }
    }

    fn page_of(script: Option<PageScript>) -> ApiResult<IllustPage> {
        match script {
            Some(Ok((illusts, has_next))) => Ok(IllustPage {
                illusts,
                next_url: has_next.then(|| "https://app-api.pixiv.net/next".to_string()),
            }),
            Some(Err(status)) => Err(ApiError::api(status, "scripted failure")),
            None => Ok(IllustPage::default()),
        }
    }

    #[async_trait]
    impl IllustSource for FakeSource {
        async fn bookmarks_page(
            &self,
            _user_id: u64,
            _restrict: Restrict,
            _next_url: Option<&str>,
        ) -> ApiResult<IllustPage> {
            page_of(self.bookmarks.lock().unwrap().pop_front())
        }

        async fn following_page(
            &self,
            _user_id: u64,
            _restrict: Restrict,
            _next_url: Option<&str>,
        ) -> ApiResult<UserPreviewPage> {
            let authors = self.following.lock().unwrap().pop_front().unwrap_or_default();
            Ok(UserPreviewPage {
                user_previews: authors
                    .into_iter()
                    .map(|id| UserPreview {
                        user: IllustUser {
                            id,
                            ..Default::default()
                        },
                    })
                    .collect(),
                next_url: None,
            })
        }

        async fn author_illusts_page(
            &self,
            author_id: u64,
            _next_url: Option<&str>,
        ) -> ApiResult<IllustPage> {
            page_of(
                self.author_pages
                    .lock()
                    .unwrap()
                    .get_mut(&author_id)
                    .and_then(|pages| pages.pop_front()),
            )
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(3600)
    }

    struct Fixture {
        repo: MetadataRepository,
        config: BackupConfig,
        cancel: CancellationToken,
        queue: TaskQueue,
        cursors: ScanCursors,
        _dir: tempfile::TempDir,
    }

    fn fixture(max_downloads: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = MetadataRepository::open(&dir.path().join("pixiv.db")).unwrap();
        let mut kv = HashMap::new();
        kv.insert("user_id".to_string(), "660788".to_string());
        kv.insert("refresh_token".to_string(), "rt".to_string());
        kv.insert("max_downloads".to_string(), max_downloads.to_string());
        kv.insert(
            "output_dir".to_string(),
            dir.path().to_string_lossy().to_string(),
        );
        let config = BackupConfig::from_kv(&kv);
        let queue = TaskQueue::load(dir.path().join("task_queue.json")).unwrap();
        Fixture {
            repo,
            config,
            cancel: CancellationToken::new(),
            queue,
            cursors: ScanCursors::default(),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn fresh_full_scan_enqueues_all_and_numbers_bookmarks() {
        let mut fx = fixture(0);
        let source = FakeSource::with_bookmarks(vec![Ok((
            vec![
                mk_illust(105, "2026-07-05T00:00:00+09:00"),
                mk_illust(104, "2026-07-04T00:00:00+09:00"),
                mk_illust(103, "2026-07-03T00:00:00+09:00"),
                mk_illust(102, "2026-07-02T00:00:00+09:00"),
                mk_illust(101, "2026-07-01T00:00:00+09:00"),
            ],
            false,
        ))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert_eq!(outcome.scanned, 5);
        assert_eq!(outcome.enqueued, 5);
        assert_eq!(fx.queue.len(), 5);
        // Newest bookmark gets the highest order, oldest gets 0.
        for (id, expected) in [(105u64, 4u64), (104, 3), (103, 2), (102, 1), (101, 0)] {
            let item = fx.queue.get(id).unwrap();
            assert_eq!(item.illust.bookmark_order, Some(expected), "id {id}");
            assert!(item.is_bookmarked);
        }
        assert!(!fx.cursors.bookmarks.full_scan, "full walk completed");
        assert_eq!(fx.cursors.bookmarks.latest_seen_illust_id, 105);
    }

    #[tokio::test]
    async fn incremental_scan_stops_on_consecutive_known_run() {
        let mut fx = fixture(0);
        fx.cursors.bookmarks.full_scan = false;

        // 60 works already fully downloaded.
        let mut known = Vec::new();
        for id in 1..=60u64 {
            let illust = mk_illust(id, "2026-06-01T00:00:00+09:00");
            fx.repo.save_illust(&illust).unwrap();
            fx.repo.mark_downloaded(id, "x", None).unwrap();
            known.push(illust);
        }
        known.reverse();
        let source = FakeSource::with_bookmarks(vec![Ok((known, true))]);

        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert_eq!(outcome.scanned, u64::from(CONSECUTIVE_KNOWN_STOP));
        assert_eq!(outcome.enqueued, 0);
        assert!(fx.cursors.bookmarks.incremental_stopped);
    }

    #[tokio::test]
    async fn incremental_scan_numbers_only_the_new_top_run() {
        let mut fx = fixture(0);
        fx.cursors.bookmarks.full_scan = false;

        // One previously downloaded work holding order 6.
        let old = mk_illust(10, "2026-06-01T00:00:00+09:00");
        fx.repo.save_illust(&old).unwrap();
        fx.repo.mark_downloaded(10, "x", None).unwrap();
        fx.repo.set_bookmark_order(10, 6).unwrap();

        let source = FakeSource::with_bookmarks(vec![Ok((
            vec![
                mk_illust(30, "2026-07-03T00:00:00+09:00"),
                mk_illust(20, "2026-07-02T00:00:00+09:00"),
                old.clone(),
                // New work below the known run: enqueued but unnumbered.
                mk_illust(5, "2026-05-01T00:00:00+09:00"),
            ],
            false,
        ))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert_eq!(outcome.enqueued, 3);
        assert_eq!(fx.queue.get(30).unwrap().illust.bookmark_order, Some(8));
        assert_eq!(fx.queue.get(20).unwrap().illust.bookmark_order, Some(7));
        assert_eq!(fx.queue.get(5).unwrap().illust.bookmark_order, None);
    }

    #[tokio::test]
    async fn placeholder_is_recorded_and_never_requeued() {
        let mut fx = fixture(0);
        let source = FakeSource::with_bookmarks(vec![Ok((vec![mk_limited(50)], false))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert_eq!(outcome.limited, 1);
        assert_eq!(fx.queue.len(), 0);
        assert!(fx.repo.is_access_limited(50).unwrap());

        // Second round: the limited work now counts as known.
        let source = FakeSource::with_bookmarks(vec![Ok((vec![mk_limited(50)], false))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();
        assert_eq!(outcome.limited, 0);
        assert_eq!(outcome.known, 1);
        assert_eq!(fx.queue.len(), 0);
    }

    #[tokio::test]
    async fn admission_control_stops_feeding_at_max_downloads() {
        let mut fx = fixture(3);
        fx.cursors.bookmarks.full_scan = false;
        let works: Vec<Illust> = (1..=10u64)
            .rev()
            .map(|id| mk_illust(id, "2026-07-01T00:00:00+09:00"))
            .collect();
        let source = FakeSource::with_bookmarks(vec![Ok((works, true))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert!(outcome.hit_admission_limit);
        assert_eq!(fx.queue.counts().pending, 3);
    }

    #[tokio::test]
    async fn expired_round_deadline_stops_the_scan() {
        let mut fx = fixture(0);
        let source = FakeSource::with_bookmarks(vec![Ok((
            vec![mk_illust(1, "2026-07-01T00:00:00+09:00")],
            false,
        ))]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, Instant::now());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert!(outcome.deadline_exceeded);
        assert_eq!(outcome.scanned, 0, "no page is fetched past the cap");
        assert!(fx.queue.is_empty());
        assert!(fx.cursors.bookmarks.full_scan, "cursor state untouched");
    }

    #[tokio::test]
    async fn rate_limited_listing_leaves_cursor_untouched() {
        let mut fx = fixture(0);
        fx.cursors.bookmarks.full_scan = false;
        fx.cursors.bookmarks.latest_seen_illust_id = 99;
        let source = FakeSource::with_bookmarks(vec![Err(429)]);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_bookmarks(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert!(outcome.rate_limited);
        assert!(outcome.last_error.is_some());
        assert_eq!(fx.cursors.bookmarks.latest_seen_illust_id, 99);
    }

    #[tokio::test]
    async fn following_scan_stops_at_the_author_cursor() {
        let mut fx = fixture(0);
        let now = Utc::now();
        fx.cursors
            .advance_author(660, 100, Some("2026-07-01T00:00:00+09:00"), now);

        let mut pages = HashMap::new();
        pages.insert(
            660u64,
            VecDeque::from([Ok((
                vec![
                    mk_illust(120, "2026-07-20T00:00:00+09:00"),
                    mk_illust(110, "2026-07-10T00:00:00+09:00"),
                    mk_illust(100, "2026-07-01T00:00:00+09:00"),
                    mk_illust(90, "2026-06-01T00:00:00+09:00"),
                ],
                false,
            )) as PageScript]),
        );
        let source = FakeSource::with_authors(vec![660], pages);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_following(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        assert_eq!(outcome.enqueued, 2);
        assert!(fx.queue.get(120).unwrap().is_following_author);
        assert!(fx.queue.get(100).is_none(), "stopped at the cursor");
        assert_eq!(
            fx.cursors.author(660).unwrap().latest_seen_illust_id,
            120,
            "cursor advanced to the newest observed work"
        );
    }

    #[tokio::test]
    async fn ordering_anomaly_discards_the_author_cursor() {
        let mut fx = fixture(0);
        let now = Utc::now();
        fx.cursors
            .advance_author(660, 100, Some("2026-07-01T00:00:00+09:00"), now);

        let mut pages = HashMap::new();
        pages.insert(
            660u64,
            VecDeque::from([Ok((
                vec![
                    mk_illust(110, "2026-07-10T00:00:00+09:00"),
                    // Newer than the work before it: out of order.
                    mk_illust(130, "2026-07-30T00:00:00+09:00"),
                    mk_illust(90, "2026-06-01T00:00:00+09:00"),
                ],
                false,
            )) as PageScript]),
        );
        let source = FakeSource::with_authors(vec![660], pages);
        let scanner = Scanner::new(&source, &fx.repo, &fx.config, &fx.cancel, far_deadline());
        let outcome = scanner
            .scan_following(&mut fx.queue, &mut fx.cursors)
            .await
            .unwrap();

        // With the cursor distrusted, everything eligible is enqueued
        // and the next scan of this author is a full walk.
        assert_eq!(outcome.enqueued, 3);
        assert!(fx.cursors.author(660).is_none());
    }
}
