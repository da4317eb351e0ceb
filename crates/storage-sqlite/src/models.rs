//! Row types for the metadata store.

use diesel::prelude::*;

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(user_id))]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserRow {
    pub user_id: i64,
    pub name: String,
    pub account: String,
    pub profile_image_url: String,
    pub is_premium: Option<bool>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone)]
#[diesel(primary_key(illust_id))]
#[diesel(table_name = crate::schema::illusts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IllustRow {
    pub illust_id: i64,
    pub user_id: i64,
    pub title: String,
    pub caption: String,
    pub create_date: String,
    pub page_count: i32,
    pub width: i32,
    pub height: i32,
    pub bookmark_count: i64,
    pub view_count: i64,
    pub sanity_level: i32,
    pub x_restrict: i32,
    pub illust_type: String,
    pub image_urls_json: String,
    pub tags_json: String,
    pub downloaded: bool,
    pub download_path: Option<String>,
    pub downloaded_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub file_size: Option<i64>,
    pub bookmark_order: Option<i64>,
    pub is_access_limited: bool,
}

/// Insert form of an illust row; `downloaded` starts false.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::illusts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewIllustRow {
    pub illust_id: i64,
    pub user_id: i64,
    pub title: String,
    pub caption: String,
    pub create_date: String,
    pub page_count: i32,
    pub width: i32,
    pub height: i32,
    pub bookmark_count: i64,
    pub view_count: i64,
    pub sanity_level: i32,
    pub x_restrict: i32,
    pub illust_type: String,
    pub image_urls_json: String,
    pub tags_json: String,
    pub downloaded: bool,
    pub created_at: String,
    pub updated_at: String,
    pub bookmark_order: Option<i64>,
    pub is_access_limited: bool,
}

/// Re-observation change set. Download outcome columns are absent on
/// purpose so an upsert can never regress `downloaded = true`; `None`
/// fields are skipped, so a missing `bookmark_order` keeps the stored
/// value.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = crate::schema::illusts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IllustChanges {
    pub user_id: i64,
    pub title: String,
    pub caption: String,
    pub create_date: String,
    pub page_count: i32,
    pub width: i32,
    pub height: i32,
    pub bookmark_count: i64,
    pub view_count: i64,
    pub sanity_level: i32,
    pub x_restrict: i32,
    pub illust_type: String,
    pub image_urls_json: String,
    pub tags_json: String,
    pub updated_at: String,
    pub bookmark_order: Option<i64>,
    pub is_access_limited: bool,
}

#[derive(Queryable, Identifiable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::download_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DownloadHistoryRow {
    pub id: i32,
    pub illust_id: i64,
    pub download_time: String,
    pub success: bool,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::download_history)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewDownloadHistoryRow {
    pub illust_id: i64,
    pub download_time: String,
    pub success: bool,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
}
