//! Per-work metadata document written next to the downloaded files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::illust::{Illust, IllustKind, UgoiraFrame};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataUser {
    pub user_id: u64,
    pub name: String,
    pub account: String,
    pub profile_image_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataImageUrls {
    pub medium: String,
    pub large: String,
    pub square_medium: String,
}

/// The document persisted as `metadata/<illust_id>.json`.
///
/// Field set and naming are the stable on-disk contract; parsing one of
/// these back yields the same fields that were serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IllustMetadata {
    pub illust_id: u64,
    pub title: String,
    pub caption: String,
    pub user: MetadataUser,
    pub create_date: String,
    pub page_count: u32,
    pub width: u32,
    pub height: u32,
    pub bookmark_count: u64,
    pub view_count: u64,
    pub sanity_level: u32,
    pub x_restrict: u32,
    #[serde(rename = "type")]
    pub kind: IllustKind,
    pub tags: Vec<String>,
    pub image_urls: MetadataImageUrls,
    pub tools: Vec<String>,
    pub download_time: String,
    pub original_url: String,
    pub is_bookmarked: bool,
    pub is_following_author: bool,
    pub bookmark_order: Option<u64>,
    pub is_access_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ugoira_frames: Option<Vec<UgoiraFrame>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ugoira_zip_url: Option<String>,
}

impl IllustMetadata {
    pub fn from_illust(illust: &Illust, downloaded_at: DateTime<Utc>) -> Self {
        Self {
            illust_id: illust.id,
            title: illust.title.clone(),
            caption: illust.caption.clone(),
            user: MetadataUser {
                user_id: illust.user.id,
                name: illust.user.name.clone(),
                account: illust.user.account.clone(),
                profile_image_url: illust.user.profile_image_urls.medium.clone(),
            },
            create_date: illust.create_date.clone(),
            page_count: illust.page_count,
            width: illust.width,
            height: illust.height,
            bookmark_count: illust.total_bookmarks,
            view_count: illust.total_view,
            sanity_level: illust.sanity_level,
            x_restrict: illust.x_restrict,
            kind: illust.kind,
            tags: illust.tag_names(),
            image_urls: MetadataImageUrls {
                medium: illust.image_urls.medium.clone(),
                large: illust.image_urls.large.clone(),
                square_medium: illust.image_urls.square_medium.clone(),
            },
            tools: illust.tools.clone(),
            download_time: downloaded_at.to_rfc3339(),
            original_url: illust.artwork_url(),
            is_bookmarked: illust.is_bookmarked,
            is_following_author: illust.is_following_author,
            bookmark_order: illust.bookmark_order,
            is_access_limited: illust.is_access_limited(),
            ugoira_frames: None,
            ugoira_zip_url: None,
        }
    }

    /// Attach animation details for ugoira works.
    pub fn with_ugoira(mut self, frames: Vec<UgoiraFrame>, zip_url: String) -> Self {
        self.ugoira_frames = Some(frames);
        self.ugoira_zip_url = Some(zip_url);
        self
    }
}
