pub(crate) mod migrations;
pub mod queries;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use hedwig_core::attachment::{Attachment, AttachmentFilter, AttachmentKind, CreateAttachment};
use hedwig_core::product::{AttachmentProduct, CreateProduct};
use hedwig_core::state::Transition;

use crate::{Database, DbConfig, DbError, StateCount};

/// Converts `rusqlite::Result<T>` into `Result<T, DbError>` so query modules
/// can write `.to_db()?`.
pub(crate) trait SqliteResultExt<T> {
    fn to_db(self) -> Result<T, DbError>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn to_db(self) -> Result<T, DbError> {
        self.map_err(map_sqlite_err)
    }
}

#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(config: &DbConfig) -> Result<Self, DbError> {
        let path = config
            .sqlite_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::data_dir().join("hedwig.db"));
        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).to_db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().to_db()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DbError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| DbError::Internal("lock poisoned".into()))?;
        f(&mut conn)
    }

    fn run_migrations(&self) -> Result<(), DbError> {
        self.with_conn(|conn| migrations::run(conn))
    }
}

/// Map a `rusqlite::Error` into a `DbError::Internal`.
pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Run a blocking query on the tokio blocking pool.
async fn blocking<F, T>(db: &SqliteDatabase, f: F) -> Result<T, DbError>
where
    F: FnOnce(&SqliteDatabase) -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?
}

#[async_trait]
impl Database for SqliteDatabase {
    // -- Attachments --
    async fn create_attachment(&self, input: &CreateAttachment) -> Result<Attachment, DbError> {
        let input = input.clone();
        blocking(self, move |db| db.create_attachment_sync(&input)).await
    }
    async fn get_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        blocking(self, move |db| db.get_attachment_sync(id)).await
    }
    async fn list_attachments(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<Vec<Attachment>, DbError> {
        let filter = filter.clone();
        blocking(self, move |db| db.list_attachments_sync(&filter)).await
    }
    async fn delete_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        blocking(self, move |db| db.delete_attachment_sync(id)).await
    }
    async fn list_new_attachments(
        &self,
        kind: AttachmentKind,
    ) -> Result<Vec<Attachment>, DbError> {
        blocking(self, move |db| db.list_new_attachments_sync(kind)).await
    }
    async fn transition_attachment(
        &self,
        id: i64,
        transition: Transition,
        message: Option<&str>,
    ) -> Result<Attachment, DbError> {
        let message = message.map(|s| s.to_string());
        blocking(self, move |db| {
            db.transition_attachment_sync(id, transition, message.as_deref())
        })
        .await
    }
    async fn find_stuck_attachments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DbError> {
        blocking(self, move |db| db.find_stuck_attachments_sync(older_than)).await
    }
    async fn count_attachments_by_state(&self) -> Result<Vec<StateCount>, DbError> {
        blocking(self, |db| db.count_attachments_by_state_sync()).await
    }

    // -- Products --
    async fn replace_products(
        &self,
        attachment_id: i64,
        products: &[CreateProduct],
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        let products = products.to_vec();
        blocking(self, move |db| db.replace_products_sync(attachment_id, &products)).await
    }
    async fn list_products(
        &self,
        attachment_id: i64,
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        blocking(self, move |db| db.list_products_sync(attachment_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_returns_working_db() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
                .to_db()?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn open_path_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("test.db");
        assert!(!db_path.exists());

        let _db = SqliteDatabase::open_path(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("test.db");
        drop(SqliteDatabase::open_path(&db_path).unwrap());

        let db = SqliteDatabase::open_path(&db_path).unwrap();
        let versions: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT count(*) FROM schema_version", [], |row| row.get(0))
                    .to_db()
            })
            .unwrap();
        assert_eq!(versions, migrations::LATEST_VERSION);
    }
}
