//! Authenticated Pixiv app-API client.
//!
//! Wraps the OAuth refresh-token session, the two listing sources the
//! scanner walks, and the image host the downloader streams from.

pub mod auth;
pub mod client;
pub mod error;
pub mod types;

pub use auth::AuthSession;
pub use client::{ClientConfig, PixivClient};
pub use error::{ApiError, Result};
pub use types::{IllustPage, UgoiraMetadata, UserPreviewPage};
