//! Atomic filesystem helpers for the durable JSON documents.
//!
//! Every durable file (queue, cursors, status, token cache) is written
//! to a temp file in the same directory, fsynced, then renamed over the
//! final name. A crash between any two writes leaves the previous
//! version intact.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::errors::Result;

/// Serialize `value` as pretty-printed UTF-8 JSON and atomically replace
/// `path` with it. Non-ASCII text is preserved as-is.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, body.as_bytes())
}

/// Atomically replace `path` with `text`.
pub fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    write_bytes_atomic(path, text.as_bytes())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Temp-file name used by atomic writes; repair knows to sweep these.
pub fn temp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        write_json_atomic(&path, &json!({"v": 2, "名前": "テスト"})).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("テスト"), "non-ASCII must not be escaped");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["v"], 2);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/doc.json");
        write_json_atomic(&path, &json!([])).unwrap();
        assert!(path.exists());
    }
}
