//! Configuration loading from the router's key/value store.
//!
//! Reads `uci -q show pixiv-backup` and flattens every section's options
//! into one map; section names only exist for the LuCI form layout. For
//! development off-router, `PIXIV_BACKUP_CONFIG` can point at a plain
//! `key=value` file instead.

use std::collections::HashMap;

use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::{Error, Result};
use tracing::debug;

const UCI_PACKAGE: &str = "pixiv-backup";

/// Read the current configuration snapshot.
pub async fn load_config() -> Result<BackupConfig> {
    let map = match std::env::var("PIXIV_BACKUP_CONFIG") {
        Ok(path) => parse_kv_file(&tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::Config(format!("cannot read PIXIV_BACKUP_CONFIG file {path}: {e}"))
        })?),
        Err(_) => parse_uci_show(&read_uci_show().await?),
    };
    debug!(keys = map.len(), "configuration snapshot loaded");
    Ok(BackupConfig::from_kv(&map))
}

async fn read_uci_show() -> Result<String> {
    let output = tokio::process::Command::new("uci")
        .args(["-q", "show", UCI_PACKAGE])
        .output()
        .await
        .map_err(|e| Error::Config(format!("failed to run uci: {e}")))?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "uci show {UCI_PACKAGE} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `pixiv-backup.<section>.<option>='value'` lines into a flat
/// option map. Later sections win on duplicate option names.
fn parse_uci_show(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let parts: Vec<&str> = key.trim().split('.').collect();
        // Three segments = package.section.option; two = section header.
        if parts.len() != 3 || parts[0] != UCI_PACKAGE {
            continue;
        }
        let value = raw_value.trim().trim_matches('\'').to_string();
        map.insert(parts[2].to_string(), value);
    }
    map
}

fn parse_kv_file(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uci_show_output_flattens_to_options() {
        let output = "\
pixiv-backup.settings=main
pixiv-backup.settings.enabled='1'
pixiv-backup.settings.user_id='660788'
pixiv-backup.settings.refresh_token='tok'
pixiv-backup.download.mode='both'
pixiv-backup.download.max_downloads='25'
";
        let map = parse_uci_show(output);
        assert_eq!(map.get("enabled").map(String::as_str), Some("1"));
        assert_eq!(map.get("user_id").map(String::as_str), Some("660788"));
        assert_eq!(map.get("mode").map(String::as_str), Some("both"));
        assert_eq!(map.get("max_downloads").map(String::as_str), Some("25"));
        assert!(!map.contains_key("settings"));

        let cfg = BackupConfig::from_kv(&map);
        assert!(cfg.enabled);
        assert_eq!(cfg.user_id, 660788);
        assert_eq!(cfg.max_downloads, 25);
    }

    #[test]
    fn kv_file_skips_comments_and_blanks() {
        let map = parse_kv_file("# dev config\n\nuser_id = 1\nrefresh_token=rt\n");
        assert_eq!(map.get("user_id").map(String::as_str), Some("1"));
        assert_eq!(map.get("refresh_token").map(String::as_str), Some("rt"));
        assert_eq!(map.len(), 2);
    }
}
