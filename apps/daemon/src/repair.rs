//! On-disk state diagnostics.
//!
//! `--check` reports problems; `--apply` additionally releases stuck
//! queue items, sweeps temp files, quarantines unparseable documents,
//! and drops the token cache so the next round re-authenticates.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use pixiv_backup_core::config::{dir_writable, BackupConfig};
use pixiv_backup_core::cursor::ScanCursors;
use pixiv_backup_core::queue::TaskQueue;
use pixiv_backup_core::status::RuntimeStatus;
use pixiv_backup_core::Error;
use pixiv_backup_storage_sqlite::MetadataRepository;

#[derive(Debug, Default)]
pub struct RepairReport {
    pub issues: Vec<String>,
    pub fixed: Vec<String>,
}

impl RepairReport {
    pub fn clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn run_repair(config: &BackupConfig, apply: bool) -> RepairReport {
    let mut report = RepairReport::default();

    for dir in [
        config.output_dir.clone(),
        config.img_dir(),
        config.metadata_dir(),
        config.data_dir(),
        config.log_dir(),
    ] {
        if !dir_writable(&dir) {
            report.issues.push(format!("directory not writable: {}", dir.display()));
        }
    }

    // Opening the store creates missing tables and columns as a side
    // effect, which is itself the schema repair.
    match MetadataRepository::open(&config.db_path()) {
        Ok(_) => {}
        Err(err) => report
            .issues
            .push(format!("database unusable: {err}")),
    }

    match TaskQueue::load(config.queue_path()) {
        Ok(mut queue) => {
            let running = queue.counts().running;
            if running > 0 {
                report
                    .issues
                    .push(format!("{running} queue items stuck in running state"));
                if apply {
                    queue.release_running(Utc::now());
                    if queue.flush().is_ok() {
                        report
                            .fixed
                            .push(format!("released {running} stuck queue items"));
                    }
                }
            }
        }
        Err(err @ Error::CorruptState { .. }) => {
            quarantine_document(&mut report, &config.queue_path(), &err, apply);
        }
        Err(err) => report.issues.push(format!("queue unreadable: {err}")),
    }

    if let Err(err @ Error::CorruptState { .. }) = ScanCursors::load(&config.cursor_path()) {
        quarantine_document(&mut report, &config.cursor_path(), &err, apply);
    }
    if config.status_path().exists() {
        if let Err(err @ Error::CorruptState { .. }) = RuntimeStatus::read(&config.status_path()) {
            quarantine_document(&mut report, &config.status_path(), &err, apply);
        }
    }

    let strays = find_stray_temp_files(config);
    if !strays.is_empty() {
        report
            .issues
            .push(format!("{} leftover temp files", strays.len()));
        if apply {
            let mut removed = 0;
            for path in strays {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
            report.fixed.push(format!("removed {removed} temp files"));
        }
    }

    if apply && config.token_path().exists() {
        if std::fs::remove_file(config.token_path()).is_ok() {
            report
                .fixed
                .push("deleted token cache, next round will re-authenticate".to_string());
            info!("token cache deleted");
        }
    }

    report
}

fn quarantine_document(report: &mut RepairReport, path: &Path, err: &Error, apply: bool) {
    report.issues.push(err.to_string());
    if !apply {
        return;
    }
    let mut quarantined = path.as_os_str().to_os_string();
    quarantined.push(".corrupt");
    if std::fs::rename(path, &quarantined).is_ok() {
        report.fixed.push(format!(
            "quarantined {} as {}",
            path.display(),
            PathBuf::from(&quarantined).display()
        ));
    }
}

/// Leftover `.tmp`/`.part` files from interrupted atomic writes.
fn find_stray_temp_files(config: &BackupConfig) -> Vec<PathBuf> {
    let mut strays = Vec::new();
    collect_temp_files(&config.data_dir(), &mut strays);
    if let Ok(entries) = std::fs::read_dir(config.img_dir()) {
        for entry in entries.flatten() {
            collect_temp_files(&entry.path(), &mut strays);
        }
    }
    collect_temp_files(&config.metadata_dir(), &mut strays);
    strays
}

fn collect_temp_files(dir: &Path, strays: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".tmp") || name.ends_with(".part") {
            strays.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_in(dir: &Path) -> BackupConfig {
        let mut kv = HashMap::new();
        kv.insert("user_id".to_string(), "1".to_string());
        kv.insert("refresh_token".to_string(), "rt".to_string());
        kv.insert("output_dir".to_string(), dir.to_string_lossy().to_string());
        BackupConfig::from_kv(&kv)
    }

    #[test]
    fn clean_tree_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        let report = run_repair(&config, false);
        assert!(report.clean(), "{:?}", report.issues);
    }

    #[test]
    fn corrupt_queue_is_quarantined_on_apply() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        std::fs::write(config.queue_path(), "{ nope").unwrap();

        let report = run_repair(&config, false);
        assert!(!report.clean());
        assert!(config.queue_path().exists(), "check mode must not touch files");

        let report = run_repair(&config, true);
        assert!(!report.fixed.is_empty());
        assert!(!config.queue_path().exists());
        let mut quarantined = config.queue_path().into_os_string();
        quarantined.push(".corrupt");
        assert!(PathBuf::from(quarantined).exists());
    }

    #[test]
    fn stray_part_files_are_swept_on_apply() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        let work_dir = config.img_dir().join("42");
        std::fs::create_dir_all(&work_dir).unwrap();
        let part = work_dir.join("42.png.part");
        std::fs::write(&part, b"half").unwrap();

        let report = run_repair(&config, true);
        assert!(!part.exists());
        assert!(report.fixed.iter().any(|f| f.contains("temp files")));
    }

    #[test]
    fn apply_drops_the_token_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        std::fs::write(config.token_path(), "{}").unwrap();
        run_repair(&config, true);
        assert!(!config.token_path().exists());
    }
}
