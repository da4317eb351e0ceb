//! The `log` subcommand: tail the per-day file or delegate to logread.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::{Error, Result};

use crate::logging::DailyLogWriter;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn tail_log(
    config: &BackupConfig,
    lines: usize,
    follow: bool,
    syslog: bool,
) -> Result<i32> {
    if syslog {
        return tail_syslog(follow).await;
    }

    let mut current = DailyLogWriter::today_path(&config.log_dir());
    let mut offset = print_tail(&current, lines)?;

    if !follow {
        return Ok(0);
    }

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let today = DailyLogWriter::today_path(&config.log_dir());
        if today != current {
            // Day rolled over; start from the top of the new file.
            current = today;
            offset = 0;
        }
        offset = print_from(&current, offset)?;
    }
}

async fn tail_syslog(follow: bool) -> Result<i32> {
    let mut cmd = tokio::process::Command::new("logread");
    cmd.args(["-e", "pixiv-backup"]);
    if follow {
        cmd.arg("-f");
    }
    let status = cmd
        .status()
        .await
        .map_err(|e| Error::Internal(format!("failed to run logread: {e}")))?;
    Ok(status.code().unwrap_or(1))
}

/// Print the last `lines` lines and return the end-of-file offset.
fn print_tail(path: &PathBuf, lines: usize) -> Result<u64> {
    let Ok(body) = std::fs::read_to_string(path) else {
        eprintln!("no log file yet: {}", path.display());
        return Ok(0);
    };
    let all: Vec<&str> = body.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    Ok(body.len() as u64)
}

/// Print anything appended past `offset`, returning the new offset.
fn print_from(path: &PathBuf, offset: u64) -> Result<u64> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(offset);
    };
    let len = file.metadata()?.len();
    if len <= offset {
        // Truncated or unchanged.
        return Ok(len.min(offset));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut appended = String::new();
    file.read_to_string(&mut appended)?;
    print!("{appended}");
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_prints_only_trailing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "a\nb\nc\n").unwrap();
        let offset = print_tail(&path, 2).unwrap();
        assert_eq!(offset, 6);
    }

    #[test]
    fn follow_picks_up_appended_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "one\n").unwrap();
        let offset = print_from(&path, 0).unwrap();
        assert_eq!(offset, 4);

        std::fs::write(&path, "one\ntwo\n").unwrap();
        let offset = print_from(&path, offset).unwrap();
        assert_eq!(offset, 8);
        assert_eq!(print_from(&path, offset).unwrap(), 8);
    }
}
