//! Typed records for upstream works.
//!
//! The app API's JSON is parsed into these structs; optional upstream
//! fields are enumerated with defaults so a sparse listing entry still
//! deserializes. Provenance flags (`is_bookmarked`, `is_following_author`,
//! `bookmark_order`) are local additions stamped by the scanner and
//! round-tripped through the queue.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Work type as reported by the listing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IllustKind {
    #[default]
    Illust,
    Manga,
    Ugoira,
}

impl IllustKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IllustKind::Illust => "illust",
            IllustKind::Manga => "manga",
            IllustKind::Ugoira => "ugoira",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileImageUrls {
    #[serde(default)]
    pub medium: String,
}

/// Author record nested inside every work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IllustUser {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub profile_image_urls: ProfileImageUrls,
    #[serde(default)]
    pub is_premium: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IllustTag {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_name: Option<String>,
}

/// Preview URL set keyed by size name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageUrls {
    #[serde(default)]
    pub square_medium: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub large: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSinglePage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaPage {
    #[serde(default)]
    pub image_urls: ImageUrls,
}

/// One animation frame of a ugoira work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UgoiraFrame {
    pub file: String,
    pub delay: u32,
}

fn default_visible() -> bool {
    true
}

/// A single work as returned by the listing endpoints, plus local
/// provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Illust {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: IllustKind,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub user: IllustUser,
    #[serde(default)]
    pub tags: Vec<IllustTag>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// ISO-8601 with timezone, kept verbatim for round-tripping.
    #[serde(default)]
    pub create_date: String,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub sanity_level: u32,
    #[serde(default)]
    pub x_restrict: u32,
    #[serde(default)]
    pub image_urls: ImageUrls,
    #[serde(default)]
    pub meta_single_page: MetaSinglePage,
    #[serde(default)]
    pub meta_pages: Vec<MetaPage>,
    #[serde(default)]
    pub total_bookmarks: u64,
    #[serde(default)]
    pub total_view: u64,
    /// Upstream sets this to false on placeholder records for works that
    /// exist but cannot be fetched.
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub is_bookmarked: bool,
    #[serde(default)]
    pub is_following_author: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_order: Option<u64>,
}

impl Illust {
    /// Public artwork URL recorded as provenance in the metadata document.
    pub fn artwork_url(&self) -> String {
        format!("https://www.pixiv.net/artworks/{}", self.id)
    }

    /// True when upstream returned a structurally-valid but content-less
    /// placeholder. Such works are recorded as access-limited and never
    /// queued.
    pub fn is_access_limited(&self) -> bool {
        !self.visible || self.user.id == 0
    }

    pub fn create_date_parsed(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.create_date).ok()
    }

    /// Resolve the original-quality artifact URLs for a static work.
    ///
    /// Multi-page works list one URL per page; single-page works fall
    /// back from `meta_single_page` to the preview set. Ugoira works are
    /// resolved separately via the ugoira metadata endpoint.
    pub fn original_image_urls(&self) -> Vec<String> {
        if !self.meta_pages.is_empty() {
            return self
                .meta_pages
                .iter()
                .filter_map(|page| {
                    page.image_urls
                        .original
                        .clone()
                        .or_else(|| non_empty(&page.image_urls.large))
                })
                .collect();
        }

        self.meta_single_page
            .original_image_url
            .clone()
            .or_else(|| self.image_urls.original.clone())
            .or_else(|| non_empty(&self.image_urls.large))
            .into_iter()
            .collect()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.name.clone()).collect()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_entry() -> serde_json::Value {
        serde_json::json!({
            "id": 129053551,
            "title": "夏の終わり",
            "type": "illust",
            "caption": "",
            "user": {
                "id": 660788,
                "name": "たろう",
                "account": "taro_p",
                "profile_image_urls": {"medium": "https://i.pximg.net/user/660788.jpg"}
            },
            "tags": [{"name": "オリジナル", "translated_name": "original"}],
            "tools": ["CLIP STUDIO PAINT"],
            "create_date": "2026-07-30T12:00:00+09:00",
            "page_count": 1,
            "width": 1200,
            "height": 1600,
            "sanity_level": 2,
            "x_restrict": 0,
            "image_urls": {
                "square_medium": "https://i.pximg.net/sq.jpg",
                "medium": "https://i.pximg.net/m.jpg",
                "large": "https://i.pximg.net/l.jpg"
            },
            "meta_single_page": {"original_image_url": "https://i.pximg.net/o.png"},
            "meta_pages": [],
            "total_bookmarks": 1234,
            "total_view": 56789,
            "visible": true
        })
    }

    #[test]
    fn parses_listing_entry() {
        let illust: Illust = serde_json::from_value(listing_entry()).unwrap();
        assert_eq!(illust.id, 129053551);
        assert_eq!(illust.kind, IllustKind::Illust);
        assert_eq!(illust.user.account, "taro_p");
        assert_eq!(illust.tag_names(), vec!["オリジナル"]);
        assert!(!illust.is_access_limited());
        assert!(illust.create_date_parsed().is_some());
    }

    #[test]
    fn single_page_prefers_original_url() {
        let illust: Illust = serde_json::from_value(listing_entry()).unwrap();
        assert_eq!(
            illust.original_image_urls(),
            vec!["https://i.pximg.net/o.png".to_string()]
        );
    }

    #[test]
    fn multi_page_lists_one_url_per_page() {
        let mut value = listing_entry();
        value["page_count"] = serde_json::json!(2);
        value["meta_single_page"] = serde_json::json!({});
        value["meta_pages"] = serde_json::json!([
            {"image_urls": {"original": "https://i.pximg.net/p0.png"}},
            {"image_urls": {"large": "https://i.pximg.net/p1_l.jpg"}}
        ]);
        let illust: Illust = serde_json::from_value(value).unwrap();
        assert_eq!(
            illust.original_image_urls(),
            vec![
                "https://i.pximg.net/p0.png".to_string(),
                "https://i.pximg.net/p1_l.jpg".to_string()
            ]
        );
    }

    #[test]
    fn placeholder_is_access_limited() {
        let mut value = listing_entry();
        value["visible"] = serde_json::json!(false);
        let illust: Illust = serde_json::from_value(value).unwrap();
        assert!(illust.is_access_limited());

        let mut value = listing_entry();
        value["user"] = serde_json::json!({"id": 0, "name": "", "account": ""});
        let illust: Illust = serde_json::from_value(value).unwrap();
        assert!(illust.is_access_limited());
    }

    #[test]
    fn missing_visible_defaults_to_true() {
        let mut value = listing_entry();
        value.as_object_mut().unwrap().remove("visible");
        let illust: Illust = serde_json::from_value(value).unwrap();
        assert!(illust.visible);
    }
}
