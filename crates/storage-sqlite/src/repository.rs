//! Repository over the metadata store.
//!
//! Schema is ensured at open time: base tables are created if absent and
//! columns that arrived after the first release are added to pre-existing
//! stores non-destructively.

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use tracing::{debug, info};

use pixiv_backup_core::illust::Illust;
use pixiv_backup_core::Result;

use crate::db::{create_pool, get_connection, DbConnection, DbPool};
use crate::errors::StorageError;
use crate::models::{IllustChanges, NewDownloadHistoryRow, NewIllustRow, UserRow};
use crate::schema::{download_history, illusts, users};

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id BIGINT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    account TEXT NOT NULL DEFAULT '',
    profile_image_url TEXT NOT NULL DEFAULT '',
    is_premium BOOLEAN,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS illusts (
    illust_id BIGINT PRIMARY KEY,
    user_id BIGINT NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    caption TEXT NOT NULL DEFAULT '',
    create_date TEXT NOT NULL DEFAULT '',
    page_count INTEGER NOT NULL DEFAULT 1,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    bookmark_count BIGINT NOT NULL DEFAULT 0,
    view_count BIGINT NOT NULL DEFAULT 0,
    sanity_level INTEGER NOT NULL DEFAULT 0,
    x_restrict INTEGER NOT NULL DEFAULT 0,
    type TEXT NOT NULL DEFAULT 'illust',
    image_urls_json TEXT NOT NULL DEFAULT '{}',
    tags_json TEXT NOT NULL DEFAULT '[]',
    downloaded BOOLEAN NOT NULL DEFAULT 0,
    download_path TEXT,
    downloaded_at TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT '',
    file_size BIGINT,
    bookmark_order BIGINT,
    is_access_limited BOOLEAN NOT NULL DEFAULT 0,
    FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE TABLE IF NOT EXISTS download_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    illust_id BIGINT NOT NULL,
    download_time TEXT NOT NULL DEFAULT '',
    success BOOLEAN NOT NULL DEFAULT 0,
    file_size BIGINT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_illusts_user_id ON illusts(user_id);
CREATE INDEX IF NOT EXISTS idx_illusts_downloaded ON illusts(downloaded);
CREATE INDEX IF NOT EXISTS idx_illusts_type ON illusts(type);
";

/// Columns added after the first release; pre-existing stores get them
/// at open time.
const COLUMN_UPGRADES: [(&str, &str, &str); 4] = [
    ("illusts", "file_size", "BIGINT"),
    ("illusts", "bookmark_order", "BIGINT"),
    ("illusts", "is_access_limited", "BOOLEAN NOT NULL DEFAULT 0"),
    ("download_history", "file_size", "BIGINT"),
];

#[derive(QueryableByName)]
struct PragmaTableInfoRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountStats {
    pub total: i64,
    pub downloaded: i64,
    pub pending: i64,
}

#[derive(Debug, Clone)]
pub struct RecentDownload {
    pub illust_id: i64,
    pub title: String,
    pub downloaded_at: Option<String>,
    pub author_name: String,
    pub author_account: String,
}

/// Durable record of works and per-file download outcomes.
pub struct MetadataRepository {
    pool: DbPool,
}

impl MetadataRepository {
    /// Open the store, creating and upgrading the schema as needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        let pool = create_pool(db_path)?;
        let repo = Self { pool };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<DbConnection> {
        Ok(get_connection(&self.pool)?)
    }

    fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.conn()?;
        conn.batch_execute(BASE_SCHEMA)
            .map_err(|e| StorageError::Schema(e.to_string()))?;

        for (table, column, ddl) in COLUMN_UPGRADES {
            let existing = table_columns(&mut conn, table)?;
            if !existing.iter().any(|c| c == column) {
                info!(table, column, "adding missing column to pre-existing store");
                diesel::sql_query(format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
                    .execute(&mut conn)
                    .map_err(|e| StorageError::Schema(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Upsert a work and its author.
    ///
    /// Re-observation refreshes listing attributes but never touches the
    /// download-outcome columns, so `downloaded = true` cannot regress.
    /// A `None` bookmark_order leaves any stored order in place.
    pub fn save_illust(&self, illust: &Illust) -> Result<()> {
        let mut conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let image_urls_json = serde_json::to_string(&illust.image_urls)
            .map_err(pixiv_backup_core::Error::from)?;
        let tags_json = serde_json::to_string(&illust.tag_names())
            .map_err(pixiv_backup_core::Error::from)?;

        let user = UserRow {
            user_id: illust.user.id as i64,
            name: illust.user.name.clone(),
            account: illust.user.account.clone(),
            profile_image_url: illust.user.profile_image_urls.medium.clone(),
            is_premium: illust.user.is_premium,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let new_row = NewIllustRow {
            illust_id: illust.id as i64,
            user_id: illust.user.id as i64,
            title: illust.title.clone(),
            caption: illust.caption.clone(),
            create_date: illust.create_date.clone(),
            page_count: illust.page_count as i32,
            width: illust.width as i32,
            height: illust.height as i32,
            bookmark_count: illust.total_bookmarks as i64,
            view_count: illust.total_view as i64,
            sanity_level: illust.sanity_level as i32,
            x_restrict: illust.x_restrict as i32,
            illust_type: illust.kind.as_str().to_string(),
            image_urls_json: image_urls_json.clone(),
            tags_json: tags_json.clone(),
            downloaded: false,
            created_at: now.clone(),
            updated_at: now.clone(),
            bookmark_order: illust.bookmark_order.map(|o| o as i64),
            is_access_limited: illust.is_access_limited(),
        };

        let changes = IllustChanges {
            user_id: illust.user.id as i64,
            title: illust.title.clone(),
            caption: illust.caption.clone(),
            create_date: illust.create_date.clone(),
            page_count: illust.page_count as i32,
            width: illust.width as i32,
            height: illust.height as i32,
            bookmark_count: illust.total_bookmarks as i64,
            view_count: illust.total_view as i64,
            sanity_level: illust.sanity_level as i32,
            x_restrict: illust.x_restrict as i32,
            illust_type: illust.kind.as_str().to_string(),
            image_urls_json,
            tags_json,
            updated_at: now.clone(),
            bookmark_order: illust.bookmark_order.map(|o| o as i64),
            is_access_limited: illust.is_access_limited(),
        };

        conn.transaction::<_, StorageError, _>(|conn| {
            diesel::insert_into(users::table)
                .values(&user)
                .on_conflict(users::user_id)
                .do_update()
                .set((
                    users::name.eq(&user.name),
                    users::account.eq(&user.account),
                    users::profile_image_url.eq(&user.profile_image_url),
                    users::is_premium.eq(user.is_premium),
                    users::updated_at.eq(&user.updated_at),
                ))
                .execute(conn)?;

            diesel::insert_into(illusts::table)
                .values(&new_row)
                .on_conflict(illusts::illust_id)
                .do_update()
                .set(&changes)
                .execute(conn)?;
            Ok(())
        })?;
        debug!(illust_id = illust.id, "illust upserted");
        Ok(())
    }

    /// Record a successful download: flip the flag and append history.
    pub fn mark_downloaded(
        &self,
        illust_id: u64,
        download_path: &str,
        file_size: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.transaction::<_, StorageError, _>(|conn| {
            diesel::update(illusts::table.find(illust_id as i64))
                .set((
                    illusts::downloaded.eq(true),
                    illusts::download_path.eq(download_path),
                    illusts::downloaded_at.eq(&now),
                    illusts::file_size.eq(file_size),
                ))
                .execute(conn)?;

            diesel::insert_into(download_history::table)
                .values(&NewDownloadHistoryRow {
                    illust_id: illust_id as i64,
                    download_time: now.clone(),
                    success: true,
                    file_size,
                    error_message: None,
                })
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Append a failed attempt to the history.
    pub fn record_download_error(&self, illust_id: u64, message: &str) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(download_history::table)
            .values(&NewDownloadHistoryRow {
                illust_id: illust_id as i64,
                download_time: Utc::now().to_rfc3339(),
                success: false,
                file_size: None,
                error_message: Some(message.to_string()),
            })
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Flag a work whose upstream record is an unfetchable placeholder.
    pub fn mark_limited(&self, illust_id: u64) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::update(illusts::table.find(illust_id as i64))
            .set((
                illusts::is_access_limited.eq(true),
                illusts::updated_at.eq(Utc::now().to_rfc3339()),
            ))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    pub fn is_downloaded(&self, illust_id: u64) -> Result<bool> {
        let mut conn = self.conn()?;
        let flag = illusts::table
            .find(illust_id as i64)
            .select(illusts::downloaded)
            .first::<bool>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(flag.unwrap_or(false))
    }

    pub fn is_access_limited(&self, illust_id: u64) -> Result<bool> {
        let mut conn = self.conn()?;
        let flag = illusts::table
            .find(illust_id as i64)
            .select(illusts::is_access_limited)
            .first::<bool>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(flag.unwrap_or(false))
    }

    /// Authoritative order assignment during a full bookmarks walk.
    pub fn set_bookmark_order(&self, illust_id: u64, order: i64) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::update(illusts::table.find(illust_id as i64))
            .set(illusts::bookmark_order.eq(Some(order)))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Highest assigned bookmark order, if any; incremental scans build
    /// on top of this.
    pub fn max_bookmark_order(&self) -> Result<Option<i64>> {
        let mut conn = self.conn()?;
        let max = illusts::table
            .select(diesel::dsl::max(illusts::bookmark_order))
            .first::<Option<i64>>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(max)
    }

    pub fn count_stats(&self) -> Result<CountStats> {
        let mut conn = self.conn()?;
        let total = illusts::table
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        let downloaded = illusts::table
            .filter(illusts::downloaded.eq(true))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(CountStats {
            total,
            downloaded,
            pending: total - downloaded,
        })
    }

    pub fn recent_downloads(&self, limit: i64) -> Result<Vec<RecentDownload>> {
        let mut conn = self.conn()?;
        let rows = illusts::table
            .inner_join(users::table)
            .filter(illusts::downloaded.eq(true))
            .order(illusts::downloaded_at.desc())
            .limit(limit)
            .select((
                illusts::illust_id,
                illusts::title,
                illusts::downloaded_at,
                users::name,
                users::account,
            ))
            .load::<(i64, String, Option<String>, String, String)>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(rows
            .into_iter()
            .map(
                |(illust_id, title, downloaded_at, author_name, author_account)| RecentDownload {
                    illust_id,
                    title,
                    downloaded_at,
                    author_name,
                    author_account,
                },
            )
            .collect())
    }

    /// Drop history entries older than `days`.
    pub fn cleanup_history(&self, days: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
        let deleted = diesel::delete(
            download_history::table.filter(download_history::download_time.lt(cutoff)),
        )
        .execute(&mut conn)
        .map_err(StorageError::from)?;
        Ok(deleted)
    }
}

fn table_columns(conn: &mut DbConnection, table: &str) -> Result<Vec<String>> {
    let rows = diesel::sql_query(format!("PRAGMA table_info('{table}')"))
        .load::<PragmaTableInfoRow>(conn)
        .map_err(StorageError::from)?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}
