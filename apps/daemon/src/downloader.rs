//! Download pipeline: resolve artifact URLs, stream to temp files,
//! rename on success, write the metadata document, record the outcome.
//!
//! A failed artifact deletes its temp file; final names only ever
//! appear for fully-written content.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pixiv_backup_api::types::UgoiraMetadata;
use pixiv_backup_api::{ApiError, PixivClient};
use pixiv_backup_core::audit_event;
use pixiv_backup_core::classify::ErrorCategory;
use pixiv_backup_core::config::BackupConfig;
use pixiv_backup_core::illust::{Illust, IllustKind};
use pixiv_backup_core::metadata::IllustMetadata;
use pixiv_backup_core::queue::{QueueItem, TaskError};
use pixiv_backup_core::fsutil;
use pixiv_backup_storage_sqlite::MetadataRepository;

/// One file to fetch for a work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub file_name: String,
}

/// How a single queue item ended.
#[derive(Debug)]
pub enum DownloadResult {
    Success {
        files: u32,
        bytes: u64,
        first_path: PathBuf,
    },
    /// Every artifact was already on disk.
    Skipped,
    /// Stop requested before the next artifact started.
    Cancelled,
    Failed {
        error: TaskError,
        /// Filesystem/database trouble ends the round, not just the item.
        round_fatal: bool,
    },
}

/// Transfer seam so tests can run the pipeline without the network.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn ugoira(&self, illust_id: u64) -> Result<UgoiraMetadata, ApiError>;

    /// Stream `url` into `dest`, returning the byte count.
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64, ApiError>;
}

#[async_trait]
impl ArtifactFetcher for PixivClient {
    async fn ugoira(&self, illust_id: u64) -> Result<UgoiraMetadata, ApiError> {
        Ok(self.ugoira_metadata(illust_id).await?.ugoira_metadata)
    }

    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64, ApiError> {
        let mut response = self.get_image(url).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(bytes)
    }
}

/// File extension taken from the URL path; upstream always embeds one,
/// jpg is the fallback for anything odd.
pub fn extension_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => ext.to_ascii_lowercase(),
        _ => "jpg".to_string(),
    }
}

/// Resolve the fetch plan for a static (illust/manga) work.
///
/// Multi-page works produce `<id>.p<k>.<ext>` per page, single-page
/// works `<id>.<ext>`.
pub fn static_artifacts(illust: &Illust) -> Vec<Artifact> {
    let urls = illust.original_image_urls();
    if !illust.meta_pages.is_empty() {
        urls.into_iter()
            .enumerate()
            .map(|(k, url)| {
                let ext = extension_from_url(&url);
                Artifact {
                    file_name: format!("{}.p{}.{}", illust.id, k, ext),
                    url,
                }
            })
            .collect()
    } else {
        urls.into_iter()
            .map(|url| {
                let ext = extension_from_url(&url);
                Artifact {
                    file_name: format!("{}.{}", illust.id, ext),
                    url,
                }
            })
            .collect()
    }
}

pub struct Downloader<'a, F: ArtifactFetcher> {
    fetcher: &'a F,
    repo: &'a MetadataRepository,
    config: &'a BackupConfig,
    cancel: &'a CancellationToken,
}

impl<'a, F: ArtifactFetcher> Downloader<'a, F> {
    pub fn new(
        fetcher: &'a F,
        repo: &'a MetadataRepository,
        config: &'a BackupConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            repo,
            config,
            cancel,
        }
    }

    /// Fetch every artifact of a claimed item, then persist metadata and
    /// the store record. `artifact_delay` is the pacing delay observed
    /// between artifacts.
    pub async fn download(&self, item: &QueueItem, artifact_delay: Duration) -> DownloadResult {
        let illust = &item.illust;
        audit_event!(
            "download_start",
            illust_id = illust.id,
            illust_type = illust.kind.as_str(),
            title = illust.title
        );

        if let Err(err) = self.repo.save_illust(illust) {
            return DownloadResult::Failed {
                error: TaskError::new(
                    ErrorCategory::Unknown,
                    None,
                    format!("metadata store write failed: {err}"),
                ),
                round_fatal: true,
            };
        }

        let (artifacts, ugoira) = match self.resolve_artifacts(illust).await {
            Ok(plan) => plan,
            Err(result) => return *result,
        };

        let dir = self.config.img_dir_for(illust.id);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            return self.fail_io(illust, &format!("cannot create {}: {err}", dir.display()));
        }

        let mut fetched = 0u32;
        let mut total_bytes = 0u64;
        let mut first_path: Option<PathBuf> = None;

        for (index, artifact) in artifacts.iter().enumerate() {
            // A stop request lets the in-flight artifact finish; we only
            // check between artifacts.
            if self.cancel.is_cancelled() {
                audit_event!("download_cancelled", illust_id = illust.id);
                return DownloadResult::Cancelled;
            }

            let final_path = dir.join(&artifact.file_name);
            if first_path.is_none() {
                first_path = Some(final_path.clone());
            }
            if final_path.exists() {
                audit_event!(
                    "file_skip",
                    illust_id = illust.id,
                    path = final_path.display(),
                    reason = "file_exists"
                );
                continue;
            }

            if index > 0 && !artifact_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        audit_event!("download_cancelled", illust_id = illust.id);
                        return DownloadResult::Cancelled;
                    }
                    _ = tokio::time::sleep(artifact_delay) => {}
                }
            }

            match self.fetch_artifact(illust, artifact, &final_path).await {
                Ok(bytes) => {
                    fetched += 1;
                    total_bytes += bytes;
                }
                Err(result) => return *result,
            }
        }

        // All artifacts are in place; persist the document and the record.
        let mut metadata = IllustMetadata::from_illust(illust, Utc::now());
        if let Some(meta) = ugoira {
            let zip_url = meta.zip_urls.best().unwrap_or_default().to_string();
            metadata = metadata.with_ugoira(meta.frames, zip_url);
        }
        let metadata_path = self.config.metadata_path_for(illust.id);
        if let Err(err) = fsutil::write_json_atomic(&metadata_path, &metadata) {
            return self.fail_io(illust, &format!("metadata write failed: {err}"));
        }

        let recorded_path = first_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        if let Err(err) = self.repo.mark_downloaded(
            illust.id,
            &recorded_path,
            Some(total_bytes as i64),
        ) {
            return self.fail_io(illust, &format!("store update failed: {err}"));
        }

        audit_event!(
            "download_finish",
            illust_id = illust.id,
            status = if fetched == 0 { "skipped" } else { "success" },
            files = artifacts.len(),
            fetched = fetched,
            bytes = total_bytes
        );
        if fetched == 0 {
            DownloadResult::Skipped
        } else {
            info!(
                illust_id = illust.id,
                files = artifacts.len(),
                bytes = total_bytes,
                "work downloaded"
            );
            DownloadResult::Success {
                files: artifacts.len() as u32,
                bytes: total_bytes,
                first_path: first_path.unwrap_or_default(),
            }
        }
    }

    async fn resolve_artifacts(
        &self,
        illust: &Illust,
    ) -> Result<(Vec<Artifact>, Option<UgoiraMetadata>), Box<DownloadResult>> {
        if illust.kind == IllustKind::Ugoira {
            let meta = match self.fetcher.ugoira(illust.id).await {
                Ok(meta) => meta,
                Err(err) => return Err(Box::new(self.fail_api(illust, None, err))),
            };
            let Some(zip_url) = meta.zip_urls.best() else {
                return Err(Box::new(self.fail_invalid(illust, "no ugoira archive url")));
            };
            let artifact = Artifact {
                url: zip_url.to_string(),
                file_name: format!("{}.zip", illust.id),
            };
            return Ok((vec![artifact], Some(meta)));
        }

        let artifacts = static_artifacts(illust);
        if artifacts.is_empty() {
            return Err(Box::new(self.fail_invalid(illust, "no downloadable artifact urls")));
        }
        Ok((artifacts, None))
    }

    async fn fetch_artifact(
        &self,
        illust: &Illust,
        artifact: &Artifact,
        final_path: &Path,
    ) -> Result<u64, Box<DownloadResult>> {
        let tmp = part_path(final_path);
        if tmp.exists() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        audit_event!(
            "file_download_start",
            illust_id = illust.id,
            url = artifact.url,
            path = final_path.display()
        );

        match self.fetcher.fetch_to_file(&artifact.url, &tmp).await {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::rename(&tmp, final_path).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(Box::new(
                        self.fail_io(illust, &format!("rename failed: {err}")),
                    ));
                }
                audit_event!(
                    "file_download_finish",
                    illust_id = illust.id,
                    status = "success",
                    path = final_path.display(),
                    file_size = bytes
                );
                Ok(bytes)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                audit_event!(
                    "file_download_finish",
                    illust_id = illust.id,
                    status = "failed",
                    url = artifact.url,
                    error = err
                );
                Err(Box::new(self.fail_api(illust, Some(&artifact.url), err)))
            }
        }
    }

    fn fail_api(&self, illust: &Illust, url: Option<&str>, err: ApiError) -> DownloadResult {
        if matches!(err, ApiError::Io(_)) {
            return self.fail_io(illust, &err.to_string());
        }
        let message = match url {
            Some(url) => format!(
                "pid={} url={} artifact={} error={}",
                illust.id,
                illust.artwork_url(),
                url,
                err
            ),
            None => format!("pid={} url={} error={}", illust.id, illust.artwork_url(), err),
        };
        warn!(illust_id = illust.id, error = %err, "download failed");
        if let Err(db_err) = self.repo.record_download_error(illust.id, &message) {
            warn!(illust_id = illust.id, error = %db_err, "could not record download error");
        }
        DownloadResult::Failed {
            error: TaskError::new(err.category(), err.status_code(), message),
            round_fatal: false,
        }
    }

    fn fail_invalid(&self, illust: &Illust, reason: &str) -> DownloadResult {
        let message = format!("pid={} url={} error={}", illust.id, illust.artwork_url(), reason);
        if let Err(db_err) = self.repo.record_download_error(illust.id, &message) {
            warn!(illust_id = illust.id, error = %db_err, "could not record download error");
        }
        DownloadResult::Failed {
            error: TaskError::new(ErrorCategory::Invalid, None, message),
            round_fatal: false,
        }
    }

    fn fail_io(&self, illust: &Illust, message: &str) -> DownloadResult {
        let message = format!("pid={} error={}", illust.id, message);
        warn!(illust_id = illust.id, "{message}");
        if let Err(db_err) = self.repo.record_download_error(illust.id, &message) {
            warn!(illust_id = illust.id, error = %db_err, "could not record download error");
        }
        DownloadResult::Failed {
            error: TaskError::new(ErrorCategory::Unknown, None, message),
            round_fatal: true,
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
