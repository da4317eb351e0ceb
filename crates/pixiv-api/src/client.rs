//! Authenticated client for the listing, detail and image endpoints.

use std::path::PathBuf;
use std::time::Duration;

use pixiv_backup_core::classify::ErrorCategory;
use pixiv_backup_core::config::Restrict;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::AuthSession;
use crate::error::{ApiError, Result};
use crate::types::{IllustPage, UgoiraMetadataResponse, UserDetail, UserPreviewPage};

const APP_API_BASE: &str = "https://app-api.pixiv.net";
/// The image host rejects requests without this referer.
const IMAGE_REFERER: &str = "https://app-api.pixiv.net/";
const USER_AGENT: &str = "PixivAndroidApp/6.98.0 (Android 11; Pixel 5)";

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Settings needed to construct a [`PixivClient`].
pub struct ClientConfig {
    pub refresh_token: String,
    pub token_path: PathBuf,
    pub timeout: Duration,
}

/// HTTP client wrapping the auth session.
///
/// Every request goes out with a fresh access token; a response that
/// classifies as `auth` invalidates the cached token and is replayed
/// once after a refresh.
pub struct PixivClient {
    http: reqwest::Client,
    auth: AuthSession,
}

impl PixivClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let auth = AuthSession::new(http.clone(), config.refresh_token, config.token_path);
        Ok(Self { http, auth })
    }

    /// Refresh the session eagerly; used by the connectivity self-test.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.auth.ensure_fresh().await.map(|_| ())
    }

    /// First or continuation page of the user's bookmarks, newest-added
    /// first.
    pub async fn user_bookmarks(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> Result<IllustPage> {
        match next_url {
            Some(url) => self.get_json(url, &[]).await,
            None => {
                let url = format!("{APP_API_BASE}/v1/user/bookmarks/illust");
                self.get_json(
                    &url,
                    &[
                        ("user_id", user_id.to_string()),
                        ("restrict", restrict.as_str().to_string()),
                    ],
                )
                .await
            }
        }
    }

    /// First or continuation page of the user's follow list.
    pub async fn user_following(
        &self,
        user_id: u64,
        restrict: Restrict,
        next_url: Option<&str>,
    ) -> Result<UserPreviewPage> {
        match next_url {
            Some(url) => self.get_json(url, &[]).await,
            None => {
                let url = format!("{APP_API_BASE}/v1/user/following");
                self.get_json(
                    &url,
                    &[
                        ("user_id", user_id.to_string()),
                        ("restrict", restrict.as_str().to_string()),
                    ],
                )
                .await
            }
        }
    }

    /// First or continuation page of an author's works, newest first.
    pub async fn user_illusts(&self, user_id: u64, next_url: Option<&str>) -> Result<IllustPage> {
        match next_url {
            Some(url) => self.get_json(url, &[]).await,
            None => {
                let url = format!("{APP_API_BASE}/v1/user/illusts");
                self.get_json(
                    &url,
                    &[
                        ("user_id", user_id.to_string()),
                        ("type", "illust".to_string()),
                    ],
                )
                .await
            }
        }
    }

    pub async fn user_detail(&self, user_id: u64) -> Result<UserDetail> {
        let url = format!("{APP_API_BASE}/v1/user/detail");
        self.get_json(&url, &[("user_id", user_id.to_string())])
            .await
    }

    pub async fn ugoira_metadata(&self, illust_id: u64) -> Result<UgoiraMetadataResponse> {
        let url = format!("{APP_API_BASE}/v1/ugoira/metadata");
        self.get_json(&url, &[("illust_id", illust_id.to_string())])
            .await
    }

    /// Open a streaming response for an artifact URL.
    ///
    /// The image host authenticates by referer, not token; the caller
    /// streams the body to disk chunk by chunk.
    pub async fn get_image(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, IMAGE_REFERER)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::api(status.as_u16(), truncate(&body)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        match self.try_get_json(url, query).await {
            Err(err) if err.category() == ErrorCategory::Auth => {
                warn!(url, "auth-classified response, refreshing session and replaying once");
                self.auth.invalidate().await;
                match self.try_get_json(url, query).await {
                    Err(second) if second.category() == ErrorCategory::Auth => Err(ApiError::auth(
                        format!("request still unauthorized after refresh: {second}"),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.auth.ensure_fresh().await?;
        let mut request = self.http.get(url).bearer_auth(token);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            debug!(status = status.as_u16(), url, "API request failed");
            return Err(ApiError::api(status.as_u16(), truncate(&body)));
        }
        serde_json::from_str(&body).map_err(|e| {
            warn!(url, error = %e, "failed to deserialize API response");
            ApiError::api(status.as_u16(), format!("failed to parse response: {e}"))
        })
    }
}

fn truncate(body: &str) -> String {
    let mut preview: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_are_truncated_for_logs() {
        let long = "x".repeat(2000);
        let preview = truncate(&long);
        assert_eq!(preview.chars().count(), MAX_ERROR_BODY_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn client_builds_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let client = PixivClient::new(ClientConfig {
            refresh_token: "rt".into(),
            token_path: dir.path().join("token.json"),
            timeout: Duration::from_secs(30),
        });
        assert!(client.is_ok());
    }
}
