//! SQLite connection pool.

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::errors::StorageError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied to every checked-out connection. WAL keeps readers
/// (the repair tool) from blocking the daemon's writes; the busy timeout
/// covers the brief overlap.
#[derive(Debug)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error>
    for ConnectionOptions
{
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA busy_timeout = 5000; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open (or create) the database file and build a small pool around it.
///
/// The daemon is the single writer, so two connections are plenty: one
/// for the pipeline, one spare for read-only tooling.
pub fn create_pool(db_path: &Path) -> Result<DbPool, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
    Pool::builder()
        .max_size(2)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(|e| StorageError::Pool(e.to_string()))
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection, StorageError> {
    pool.get().map_err(|e| StorageError::Pool(e.to_string()))
}
