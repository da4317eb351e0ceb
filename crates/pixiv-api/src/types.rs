//! Wire types for the app-API responses the backup engine consumes.

use pixiv_backup_core::illust::{Illust, IllustUser, UgoiraFrame};
use serde::Deserialize;

/// OAuth token-refresh response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// One page of a work listing; `next_url` is absent on the last page.
#[derive(Debug, Default, Deserialize)]
pub struct IllustPage {
    #[serde(default)]
    pub illusts: Vec<Illust>,
    #[serde(default)]
    pub next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserPreview {
    pub user: IllustUser,
}

/// One page of the follow list.
#[derive(Debug, Default, Deserialize)]
pub struct UserPreviewPage {
    #[serde(default)]
    pub user_previews: Vec<UserPreview>,
    #[serde(default)]
    pub next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserDetail {
    pub user: IllustUser,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UgoiraZipUrls {
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub medium: Option<String>,
    #[serde(default)]
    pub large: Option<String>,
    #[serde(default)]
    pub small: Option<String>,
}

impl UgoiraZipUrls {
    /// Best available archive URL, largest first.
    pub fn best(&self) -> Option<&str> {
        [&self.original, &self.large, &self.medium, &self.small]
            .into_iter()
            .find_map(|u| u.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UgoiraMetadata {
    #[serde(default)]
    pub zip_urls: UgoiraZipUrls,
    #[serde(default)]
    pub frames: Vec<UgoiraFrame>,
}

#[derive(Debug, Deserialize)]
pub struct UgoiraMetadataResponse {
    pub ugoira_metadata: UgoiraMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_listing_page() {
        let json = r#"{
            "illusts": [
                {"id": 1, "title": "a", "user": {"id": 2, "name": "n", "account": "acc"}},
                {"id": 3, "title": "b", "user": {"id": 4, "name": "m", "account": "bcc"}}
            ],
            "next_url": "https://app-api.pixiv.net/v1/user/bookmarks/illust?user_id=5&max_bookmark_id=100"
        }"#;
        let page: IllustPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.illusts.len(), 2);
        assert!(page.next_url.as_deref().unwrap().contains("max_bookmark_id"));
    }

    #[test]
    fn last_page_has_no_next_url() {
        let page: IllustPage = serde_json::from_str(r#"{"illusts": []}"#).unwrap();
        assert!(page.illusts.is_empty());
        assert!(page.next_url.is_none());
    }

    #[test]
    fn ugoira_zip_prefers_the_largest_variant() {
        let json = r#"{
            "ugoira_metadata": {
                "zip_urls": {"medium": "https://i.pximg.net/m.zip"},
                "frames": [{"file": "000000.jpg", "delay": 90}]
            }
        }"#;
        let parsed: UgoiraMetadataResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.ugoira_metadata.zip_urls.best(),
            Some("https://i.pximg.net/m.zip")
        );
        assert_eq!(parsed.ugoira_metadata.frames[0].delay, 90);

        let with_original = UgoiraZipUrls {
            original: Some("o.zip".into()),
            medium: Some("m.zip".into()),
            ..Default::default()
        };
        assert_eq!(with_original.best(), Some("o.zip"));
    }

    #[test]
    fn token_response_tolerates_missing_rotation() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "at", "expires_in": 3600}"#).unwrap();
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
    }
}
