//! Refresh-token → access-token lifecycle with an on-disk cache.
//!
//! The cache lives at `data/token.json` so a daemon restart does not
//! need a fresh exchange. Tokens are refreshed when their remaining
//! lifetime drops under a safety margin, and invalidated when a request
//! comes back auth-classified.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pixiv_backup_core::fsutil;

use crate::error::{ApiError, Result};
use crate::types::TokenResponse;

const AUTH_TOKEN_URL: &str = "https://oauth.secure.pixiv.net/auth/token";
const CLIENT_ID: &str = "MOBrBDS8blbauoSck0ZfDbtuzpyT";
const CLIENT_SECRET: &str = "lsACyCD94FhDUtGTXi3QzcFE2uU1hqtDaKeqrdwj";
const CLIENT_HASH_SALT: &str = "28c1fdd170a5204386cb1313c7077b34f83e4aaf4aa829ce78c231e05b0bae2c";

/// Remaining lifetime under which a token is refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Persisted form of an exchanged token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    /// Token presented at the next exchange; upstream may rotate it
    /// away from the configured one.
    pub refresh_token: String,
    /// The configured token this rotation chain started from. A cache
    /// whose chain began with the configured token stays valid even
    /// after rotation.
    #[serde(default)]
    pub source_refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub obtained_at: DateTime<Utc>,
}

impl CachedToken {
    /// True while the token still has more than the refresh margin left.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > ChronoDuration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Maintains the access token for the configured refresh token.
pub struct AuthSession {
    http: reqwest::Client,
    refresh_token: String,
    token_path: PathBuf,
    cached: Mutex<Option<CachedToken>>,
}

impl AuthSession {
    pub fn new(http: reqwest::Client, refresh_token: String, token_path: PathBuf) -> Self {
        Self {
            http,
            refresh_token,
            token_path,
            cached: Mutex::new(None),
        }
    }

    /// Return a usable access token, refreshing first when the cached one
    /// is missing or about to expire.
    pub async fn ensure_fresh(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = load_cached_token(&self.token_path, &self.refresh_token);
        }
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.access_token.clone());
            }
            debug!("cached access token below refresh margin, refreshing");
        }

        let (current_refresh, source) = refresh_inputs(cached.as_ref(), &self.refresh_token);
        let token = self.refresh(&current_refresh, &source).await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    /// Expire the cached access token so the next request performs a
    /// refresh. Called when a response comes back auth-classified. The
    /// refresh token is kept: a rotated one must survive invalidation
    /// or the next exchange would present a revoked value.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = load_cached_token(&self.token_path, &self.refresh_token);
        }
        if let Some(token) = cached.as_mut() {
            token.expires_at = DateTime::<Utc>::UNIX_EPOCH;
        }
    }

    async fn refresh(&self, current_refresh: &str, source: &str) -> Result<CachedToken> {
        let client_time = Utc::now().format("%Y-%m-%dT%H:%M:%S+00:00").to_string();
        let client_hash = format!("{:x}", md5::compute(format!("{client_time}{CLIENT_HASH_SALT}")));

        let response = self
            .http
            .post(AUTH_TOKEN_URL)
            .header("X-Client-Time", client_time)
            .header("X-Client-Hash", client_hash)
            .form(&[
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("grant_type", "refresh_token"),
                ("refresh_token", current_refresh),
                ("include_policy", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "token refresh rejected");
            return Err(ApiError::auth(format!(
                "token refresh failed with status {}: {}",
                status.as_u16(),
                body.chars().take(256).collect::<String>()
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::auth(format!("token response did not parse: {e}")))?;

        let now = Utc::now();
        let token = CachedToken {
            access_token: parsed.access_token,
            // Upstream may rotate the refresh token; keep whichever is
            // current so later refreshes present it.
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| current_refresh.to_string()),
            source_refresh_token: source.to_string(),
            expires_at: now + ChronoDuration::seconds(parsed.expires_in as i64),
            obtained_at: now,
        };

        if let Err(err) = persist_token(&self.token_path, &token) {
            warn!(error = %err, "failed to persist token cache");
        } else {
            info!("access token refreshed and cached");
        }
        Ok(token)
    }
}

/// Token to present at the next exchange, and the chain origin to
/// record on the result. The rotated token from the cache wins over the
/// static configured one.
fn refresh_inputs(cached: Option<&CachedToken>, configured_refresh: &str) -> (String, String) {
    match cached {
        Some(token) => {
            let source = if token.source_refresh_token.is_empty() {
                configured_refresh.to_string()
            } else {
                token.source_refresh_token.clone()
            };
            (token.refresh_token.clone(), source)
        }
        None => (
            configured_refresh.to_string(),
            configured_refresh.to_string(),
        ),
    }
}

fn load_cached_token(path: &Path, configured_refresh: &str) -> Option<CachedToken> {
    let body = std::fs::read_to_string(path).ok()?;
    let token: CachedToken = serde_json::from_str(&body).ok()?;
    if configured_refresh.is_empty() {
        return Some(token);
    }
    // The cache stays valid while the configured token is part of its
    // rotation chain; a genuinely new token in config starts over.
    if token.refresh_token == configured_refresh
        || token.source_refresh_token == configured_refresh
    {
        Some(token)
    } else {
        None
    }
}

fn persist_token(path: &Path, token: &CachedToken) -> pixiv_backup_core::Result<()> {
    fsutil::write_json_atomic(path, token)?;
    restrict_permissions(path);
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
