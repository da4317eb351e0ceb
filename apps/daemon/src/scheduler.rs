//! Round orchestration and the daemon loop.
//!
//! A round is one scan+drain cycle; the loop then picks a wait interval
//! from the round's outcome and sleeps in one-second ticks, watching the
//! force-run sentinel and the stop signal.

use std::path::Path;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pixiv_backup_api::{ClientConfig, PixivClient};
use pixiv_backup_core::audit_event;
use pixiv_backup_core::classify::ErrorCategory;
use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::cursor::ScanCursors;
use pixiv_backup_core::fsutil;
use pixiv_backup_core::queue::{claim_delay, TaskOutcome, TaskQueue};
use pixiv_backup_core::status::{
    CooldownReason, RuntimeStatus, ServiceState, StatusError, StatusPublisher,
};
use pixiv_backup_storage_sqlite::MetadataRepository;

use crate::downloader::{DownloadResult, Downloader};
use crate::history::{self, RunRecord, RunStats};
use crate::scanner::{ScanOutcome, Scanner};
use crate::uci;

/// Hard wall-clock cap on a single round.
const ROUND_MAX_DURATION: Duration = Duration::from_secs(6 * 3600);
/// Consecutive item failures after which the round gives up and cools down.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 5;
/// Status re-publication cadence during active work.
const STATUS_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
/// Sentinel and stop polling granularity during waits.
const WAIT_TICK: Duration = Duration::from_secs(1);
/// Days after which done queue items are purged.
const DONE_PURGE_DAYS: i64 = 7;
/// Days of download history kept in the store.
const HISTORY_KEPT_DAYS: i64 = 30;

/// Failures that end a round as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundFatal {
    /// Token refresh could not restore access.
    Auth,
    /// Database or filesystem trouble.
    Storage,
}

#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub stats: RunStats,
    pub fatal: Option<RoundFatal>,
    /// Set when repeated item failures or the round time cap force a
    /// cooldown even though nothing was round-fatal.
    pub error_cooldown: bool,
    pub last_error: Option<StatusError>,
    pub stopped: bool,
}

/// Pick the wait after a completed round.
pub fn select_wait(
    outcome: &RoundOutcome,
    config: &BackupConfig,
) -> (Duration, ServiceState, Option<CooldownReason>) {
    let minutes = |m: u64| Duration::from_secs(m * 60);
    if outcome.stats.rate_limited {
        (
            minutes(config.cooldown_after_error_minutes),
            ServiceState::Cooldown,
            Some(CooldownReason::RateLimit),
        )
    } else if outcome.fatal.is_some() || outcome.error_cooldown {
        (
            minutes(config.cooldown_after_error_minutes),
            ServiceState::Cooldown,
            Some(CooldownReason::Error),
        )
    } else if outcome.stats.hit_max_downloads {
        (
            minutes(config.cooldown_after_limit_minutes),
            ServiceState::Cooldown,
            Some(CooldownReason::Limit),
        )
    } else {
        (
            minutes(config.sync_interval_minutes),
            ServiceState::Idle,
            None,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Elapsed,
    ForceTriggered,
    Stopped,
}

/// Sleep until the next round, waking within one tick for the stop
/// signal, the stop sentinel, or the force-run sentinel (which is
/// consumed before the new round begins).
pub async fn wait_for_next_round(
    duration: Duration,
    cancel: &CancellationToken,
    force_flag: &Path,
    stop_flag: &Path,
) -> WaitResult {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return WaitResult::Stopped;
        }
        if stop_flag.exists() {
            let _ = std::fs::remove_file(stop_flag);
            info!("stop sentinel observed, shutting down");
            cancel.cancel();
            return WaitResult::Stopped;
        }
        if force_flag.exists() {
            let _ = std::fs::remove_file(force_flag);
            info!("force-run sentinel observed, starting a round");
            audit_event!("force_trigger", consumed = true);
            return WaitResult::ForceTriggered;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return WaitResult::Elapsed;
        }
        let tick = WAIT_TICK.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return WaitResult::Stopped,
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

fn status_error(err: &pixiv_backup_core::Error, action: &str) -> StatusError {
    StatusError {
        time: Utc::now(),
        illust_id: None,
        action: action.to_string(),
        url: None,
        error: err.to_string(),
    }
}

/// One full scan+drain cycle against a fixed configuration snapshot.
pub async fn run_round(
    config: &BackupConfig,
    cancel: &CancellationToken,
    budget_override: Option<u32>,
    publisher: &mut StatusPublisher,
) -> RoundOutcome {
    let round_started = std::time::Instant::now();
    let mut outcome = RoundOutcome::default();
    let mut status = RuntimeStatus::new(ServiceState::Syncing);
    status.phase = Some("scan".to_string());
    status.message = Some("scanning listing sources".to_string());
    if let Err(err) = publisher.publish(&mut status) {
        warn!(error = %err, "status publication failed");
    }

    let max_downloads = budget_override.unwrap_or(config.max_downloads);
    if max_downloads == 0 {
        warn!("max_downloads is 0: treating as unlimited for this round");
    }
    audit_event!(
        "sync_cycle_start",
        user_id = config.user_id,
        mode = config.mode.as_str(),
        max_downloads = max_downloads
    );

    macro_rules! storage_fatal {
        ($err:expr, $action:expr) => {{
            error!(error = %$err, action = $action, "round aborted");
            outcome.fatal = Some(RoundFatal::Storage);
            let err_entry = status_error(&$err, $action);
            status.push_error(err_entry.clone());
            outcome.last_error = Some(err_entry);
            finish_round(
                &mut outcome,
                &mut status,
                publisher,
                None,
                config,
                round_started.elapsed(),
            );
            return outcome;
        }};
    }

    if let Err(err) = config.ensure_directories() {
        storage_fatal!(err, "ensure_directories");
    }
    let repo = match MetadataRepository::open(&config.db_path()) {
        Ok(repo) => repo,
        Err(err) => storage_fatal!(err, "open_store"),
    };
    let mut queue = match TaskQueue::load(config.queue_path()) {
        Ok(queue) => queue,
        Err(err) => storage_fatal!(err, "load_queue"),
    };
    let released = queue.release_running(Utc::now());
    if released > 0 {
        warn!(released, "released queue items stuck in running state");
    }
    let mut cursors = match ScanCursors::load(&config.cursor_path()) {
        Ok(cursors) => cursors,
        Err(err) => storage_fatal!(err, "load_cursors"),
    };

    let client = match PixivClient::new(ClientConfig {
        refresh_token: config.refresh_token.clone(),
        token_path: config.token_path(),
        timeout: Duration::from_secs(config.timeout_secs),
    }) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            outcome.fatal = Some(RoundFatal::Storage);
            finish_round(
                &mut outcome,
                &mut status,
                publisher,
                None,
                config,
                round_started.elapsed(),
            );
            return outcome;
        }
    };

    // Scan phase. Bookmarks first; following is skipped once the round
    // is already rate limited. The scanner shares the round's wall-clock
    // cap so a deep walk cannot outlive it.
    let round_deadline = round_started + ROUND_MAX_DURATION;
    let scanner = Scanner::new(&client, &repo, config, cancel, round_deadline);
    let mut scan = ScanOutcome::default();
    if config.mode.includes_bookmarks() {
        match scanner.scan_bookmarks(&mut queue, &mut cursors).await {
            Ok(pass) => scan.merge(pass),
            Err(err) => storage_fatal!(err, "scan_bookmarks"),
        }
    }
    if config.mode.includes_following()
        && !scan.rate_limited
        && !scan.auth_fatal
        && !cancel.is_cancelled()
    {
        match scanner.scan_following(&mut queue, &mut cursors).await {
            Ok(pass) => scan.merge(pass),
            Err(err) => storage_fatal!(err, "scan_following"),
        }
    }

    if let Err(err) = queue.flush() {
        storage_fatal!(err, "flush_queue");
    }
    if let Err(err) = cursors.save(&config.cursor_path()) {
        storage_fatal!(err, "save_cursors");
    }

    outcome.stats.rate_limited |= scan.rate_limited;
    outcome.stats.hit_max_downloads |= scan.hit_admission_limit;
    if scan.auth_fatal {
        outcome.fatal = Some(RoundFatal::Auth);
    }
    if scan.deadline_exceeded {
        warn!("round exceeded the wall-clock cap during scan, forcing cooldown");
        outcome.error_cooldown = true;
    }
    if let Some(err) = scan.last_error {
        status.push_error(err.clone());
        outcome.last_error = Some(err);
    }

    status.phase = Some("download_queue".to_string());
    status.message = Some(format!(
        "scan done: {} enqueued, {} known",
        scan.enqueued, scan.known
    ));
    status.queue = Some(queue.counts());
    status.rate_limited = outcome.stats.rate_limited;
    if let Err(err) = publisher.publish(&mut status) {
        warn!(error = %err, "status publication failed");
    }

    // Drain phase.
    if outcome.fatal.is_none()
        && !outcome.stats.rate_limited
        && !outcome.error_cooldown
        && !cancel.is_cancelled()
    {
        let downloader = Downloader::new(&client, &repo, config, cancel);
        let mut claims = 0u32;
        let mut downloaded = 0u32;
        let mut consecutive_failures = 0u32;
        let mut last_publish = std::time::Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if round_started.elapsed() > ROUND_MAX_DURATION {
                warn!("round exceeded the wall-clock cap, forcing cooldown");
                outcome.error_cooldown = true;
                break;
            }
            let now = Utc::now();
            if max_downloads > 0 && downloaded >= max_downloads {
                if queue.eligible_count(now) > 0 {
                    outcome.stats.hit_max_downloads = true;
                }
                break;
            }
            let Some(item) = queue.claim_next(now) else {
                break;
            };
            let delay = claim_delay(
                claims,
                config.high_speed_queue_size,
                config.low_speed_interval_seconds,
                config.interval_jitter_ms,
            );
            claims += 1;

            let result = downloader.download(&item, delay).await;
            let now = Utc::now();
            match result {
                DownloadResult::Success { .. } => {
                    queue.complete(item.illust_id, TaskOutcome::Success, now);
                    outcome.stats.success += 1;
                    outcome.stats.total += 1;
                    downloaded += 1;
                    consecutive_failures = 0;
                }
                DownloadResult::Skipped => {
                    queue.complete(item.illust_id, TaskOutcome::Skipped, now);
                    outcome.stats.skipped += 1;
                    outcome.stats.total += 1;
                    consecutive_failures = 0;
                }
                DownloadResult::Cancelled => {
                    queue.release_running(now);
                    break;
                }
                DownloadResult::Failed { error, round_fatal } => {
                    outcome.stats.failed += 1;
                    outcome.stats.total += 1;
                    let category = error.category;
                    let entry = StatusError {
                        time: now,
                        illust_id: Some(item.illust_id),
                        action: "download".to_string(),
                        url: Some(item.illust.artwork_url()),
                        error: error.message.clone(),
                    };
                    status.push_error(entry.clone());
                    outcome.last_error = Some(entry);
                    queue.complete(item.illust_id, TaskOutcome::Failed(error), now);

                    if round_fatal {
                        outcome.fatal = Some(RoundFatal::Storage);
                        break;
                    }
                    match category {
                        ErrorCategory::RateLimit => {
                            outcome.stats.rate_limited = true;
                            break;
                        }
                        ErrorCategory::Auth => {
                            outcome.fatal = Some(RoundFatal::Auth);
                            break;
                        }
                        _ => {
                            consecutive_failures += 1;
                            if consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                                warn!(
                                    consecutive_failures,
                                    "too many consecutive failures, forcing cooldown"
                                );
                                outcome.error_cooldown = true;
                                break;
                            }
                        }
                    }
                }
            }

            if let Err(err) = queue.flush() {
                storage_fatal!(err, "flush_queue");
            }
            if last_publish.elapsed() >= STATUS_PUBLISH_INTERVAL {
                sync_counters(&mut status, &outcome, &queue);
                if let Err(err) = publisher.publish(&mut status) {
                    warn!(error = %err, "status publication failed");
                }
                last_publish = std::time::Instant::now();
            }
        }
    }

    // Wrap-up: purge old work, flush everything, record the round.
    let now = Utc::now();
    queue.purge_done(now, DONE_PURGE_DAYS);
    if let Err(err) = repo.cleanup_history(HISTORY_KEPT_DAYS) {
        warn!(error = %err, "history cleanup failed");
    }
    if let Err(err) = queue.flush() {
        warn!(error = %err, "final queue flush failed");
    }
    outcome.stopped = cancel.is_cancelled();

    finish_round(
        &mut outcome,
        &mut status,
        publisher,
        Some(&queue),
        config,
        round_started.elapsed(),
    );
    outcome
}

fn sync_counters(status: &mut RuntimeStatus, outcome: &RoundOutcome, queue: &TaskQueue) {
    status.processed_total = outcome.stats.total;
    status.success = outcome.stats.success;
    status.skipped = outcome.stats.skipped;
    status.failed = outcome.stats.failed;
    status.hit_max_downloads = outcome.stats.hit_max_downloads;
    status.rate_limited = outcome.stats.rate_limited;
    status.queue = Some(queue.counts());
}

fn finish_round(
    outcome: &mut RoundOutcome,
    status: &mut RuntimeStatus,
    publisher: &mut StatusPublisher,
    queue: Option<&TaskQueue>,
    config: &BackupConfig,
    elapsed: Duration,
) {
    status.phase = Some("done".to_string());
    status.message = None;
    status.processed_total = outcome.stats.total;
    status.success = outcome.stats.success;
    status.skipped = outcome.stats.skipped;
    status.failed = outcome.stats.failed;
    status.hit_max_downloads = outcome.stats.hit_max_downloads;
    status.rate_limited = outcome.stats.rate_limited;
    if let Some(queue) = queue {
        status.queue = Some(queue.counts());
    }
    if let Err(err) = publisher.publish(status) {
        warn!(error = %err, "status publication failed");
    }

    let _ = fsutil::write_text_atomic(
        &config.last_run_path(),
        &Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    if let Err(err) = history::append_run_record(
        &config.run_history_path(),
        RunRecord::new(outcome.stats.clone(), elapsed.as_secs(), config),
    ) {
        warn!(error = %err, "could not append run history");
    }

    audit_event!(
        "sync_cycle_finish",
        success = outcome.stats.success,
        skipped = outcome.stats.skipped,
        failed = outcome.stats.failed,
        total = outcome.stats.total,
        rate_limited = outcome.stats.rate_limited,
        hit_max_downloads = outcome.stats.hit_max_downloads,
        elapsed_seconds = elapsed.as_secs()
    );
}

fn publish_state(
    publisher: &mut StatusPublisher,
    state: ServiceState,
    reason: Option<CooldownReason>,
    wait: Option<Duration>,
    last_error: Option<StatusError>,
) {
    let mut status = RuntimeStatus::new(state);
    status.cooldown_reason = reason;
    if let Some(wait) = wait {
        status.cooldown_seconds = Some(wait.as_secs());
        status.next_run_at = Some(Utc::now() + ChronoDuration::seconds(wait.as_secs() as i64));
    }
    if let Some(err) = last_error {
        status.push_error(err);
    }
    if let Err(err) = publisher.publish(&mut status) {
        warn!(error = %err, "status publication failed");
    }
}

/// The daemon loop: rounds separated by outcome-driven waits.
///
/// Returns the process exit code.
pub async fn run_daemon(cancel: CancellationToken) -> i32 {
    let mut first_iteration = true;
    let mut publisher: Option<(std::path::PathBuf, StatusPublisher)> = None;

    loop {
        // A fresh snapshot every round; changes take effect at round
        // boundaries.
        let config = match uci::load_config().await {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "cannot read configuration");
                return 1;
            }
        };

        let status_path = config.status_path();
        if publisher.as_ref().map(|(p, _)| p != &status_path).unwrap_or(true) {
            publisher = Some((status_path.clone(), StatusPublisher::new(status_path)));
        }
        let pub_ref = &mut publisher.as_mut().expect("publisher initialized above").1;

        if !config.enabled {
            info!("service disabled in configuration, exiting");
            publish_state(pub_ref, ServiceState::Stopped, None, None, None);
            return 0;
        }
        if let Err(err) = config.validate() {
            error!(error = %err, "configuration incomplete, refusing to start");
            publish_state(
                pub_ref,
                ServiceState::Stopped,
                None,
                None,
                Some(status_error(&err, "config")),
            );
            return 1;
        }
        if !pixiv_backup_core::config::dir_writable(&config.output_dir) {
            let err = pixiv_backup_core::Error::Config(format!(
                "output_dir {} is not writable",
                config.output_dir.display()
            ));
            error!(error = %err, "refusing to start");
            publish_state(
                pub_ref,
                ServiceState::Stopped,
                None,
                None,
                Some(status_error(&err, "config")),
            );
            return 1;
        }

        if first_iteration {
            // Stale sentinels from a previous life: a leftover stop flag
            // must not kill this daemon, and a leftover force flag is
            // consumed because a round is about to start anyway.
            let _ = std::fs::remove_file(config.stop_flag_path());
            let _ = std::fs::remove_file(config.force_flag_path());
            first_iteration = false;
        }

        let outcome = run_round(&config, &cancel, None, pub_ref).await;
        if cancel.is_cancelled() || outcome.stopped {
            publish_state(pub_ref, ServiceState::Stopped, None, None, None);
            info!("daemon stopped");
            return 0;
        }

        let (wait, state, reason) = select_wait(&outcome, &config);
        info!(
            wait_secs = wait.as_secs(),
            state = state.as_str(),
            "round complete, waiting"
        );
        publish_state(pub_ref, state, reason, Some(wait), outcome.last_error.clone());

        match wait_for_next_round(
            wait,
            &cancel,
            &config.force_flag_path(),
            &config.stop_flag_path(),
        )
        .await
        {
            WaitResult::Elapsed | WaitResult::ForceTriggered => continue,
            WaitResult::Stopped => {
                publish_state(pub_ref, ServiceState::Stopped, None, None, None);
                info!("daemon stopped");
                return 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> BackupConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackupConfig::from_kv(&map)
    }

    fn outcome(rate_limited: bool, hit_max: bool) -> RoundOutcome {
        RoundOutcome {
            stats: RunStats {
                rate_limited,
                hit_max_downloads: hit_max,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn wait_selection_follows_the_round_outcome() {
        let cfg = config(&[
            ("sync_interval_minutes", "360"),
            ("cooldown_after_limit_minutes", "60"),
            ("cooldown_after_error_minutes", "180"),
        ]);

        let (wait, state, reason) = select_wait(&outcome(false, false), &cfg);
        assert_eq!(wait, Duration::from_secs(360 * 60));
        assert_eq!(state, ServiceState::Idle);
        assert_eq!(reason, None);

        let (wait, state, reason) = select_wait(&outcome(true, false), &cfg);
        assert_eq!(wait, Duration::from_secs(180 * 60));
        assert_eq!(state, ServiceState::Cooldown);
        assert_eq!(reason, Some(CooldownReason::RateLimit));

        let (wait, _, reason) = select_wait(&outcome(false, true), &cfg);
        assert_eq!(wait, Duration::from_secs(60 * 60));
        assert_eq!(reason, Some(CooldownReason::Limit));

        // Rate limiting wins over the download cap.
        let (_, _, reason) = select_wait(&outcome(true, true), &cfg);
        assert_eq!(reason, Some(CooldownReason::RateLimit));

        let mut failed = outcome(false, false);
        failed.fatal = Some(RoundFatal::Auth);
        let (wait, _, reason) = select_wait(&failed, &cfg);
        assert_eq!(wait, Duration::from_secs(180 * 60));
        assert_eq!(reason, Some(CooldownReason::Error));

        let mut worn = outcome(false, false);
        worn.error_cooldown = true;
        let (_, state, reason) = select_wait(&worn, &cfg);
        assert_eq!(state, ServiceState::Cooldown);
        assert_eq!(reason, Some(CooldownReason::Error));
    }

    #[tokio::test]
    async fn force_sentinel_ends_the_wait_and_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let force = dir.path().join("force_run.flag");
        let stop = dir.path().join("stop.flag");
        std::fs::write(&force, b"").unwrap();

        let cancel = CancellationToken::new();
        let result =
            wait_for_next_round(Duration::from_secs(600), &cancel, &force, &stop).await;
        assert_eq!(result, WaitResult::ForceTriggered);
        assert!(!force.exists(), "sentinel must be consumed");
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stop_sentinel_cancels_and_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let force = dir.path().join("force_run.flag");
        let stop = dir.path().join("stop.flag");
        std::fs::write(&stop, b"").unwrap();

        let cancel = CancellationToken::new();
        let result =
            wait_for_next_round(Duration::from_secs(600), &cancel, &force, &stop).await;
        assert_eq!(result, WaitResult::Stopped);
        assert!(!stop.exists());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_elapses_without_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let force = dir.path().join("force_run.flag");
        let stop = dir.path().join("stop.flag");
        let cancel = CancellationToken::new();
        let result = wait_for_next_round(Duration::from_secs(3), &cancel, &force, &stop).await;
        assert_eq!(result, WaitResult::Elapsed);
    }
}
