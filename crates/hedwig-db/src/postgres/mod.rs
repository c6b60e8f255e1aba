pub(crate) mod migrations;
pub use migrations::MIGRATION_LOCK_KEY;
pub mod queries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use hedwig_core::attachment::{Attachment, AttachmentFilter, AttachmentKind, CreateAttachment};
use hedwig_core::product::{AttachmentProduct, CreateProduct};
use hedwig_core::state::Transition;

use crate::{Database, DbError, StateCount};

/// Map a sqlx::Error into a DbError::Internal.
pub(crate) fn pg_err(e: sqlx::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Create a DbError::NotFound with the given entity description.
pub(crate) fn pg_not_found(entity: &str) -> DbError {
    DbError::NotFound(entity.to_string())
}

#[derive(Clone)]
pub struct PostgresDatabase {
    pub(crate) pool: PgPool,
}

impl PostgresDatabase {
    /// Connect to a Postgres database and run migrations.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(pg_err)?;

        let db = Self { pool };
        migrations::run(&db.pool).await?;
        Ok(db)
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    // -- Attachments --
    async fn create_attachment(&self, input: &CreateAttachment) -> Result<Attachment, DbError> {
        self.pg_create_attachment(input).await
    }
    async fn get_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        self.pg_get_attachment(id).await
    }
    async fn list_attachments(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<Vec<Attachment>, DbError> {
        self.pg_list_attachments(filter).await
    }
    async fn delete_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        self.pg_delete_attachment(id).await
    }
    async fn list_new_attachments(
        &self,
        kind: AttachmentKind,
    ) -> Result<Vec<Attachment>, DbError> {
        self.pg_list_new_attachments(kind).await
    }
    async fn transition_attachment(
        &self,
        id: i64,
        transition: Transition,
        message: Option<&str>,
    ) -> Result<Attachment, DbError> {
        self.pg_transition_attachment(id, transition, message).await
    }
    async fn find_stuck_attachments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DbError> {
        self.pg_find_stuck_attachments(older_than).await
    }
    async fn count_attachments_by_state(&self) -> Result<Vec<StateCount>, DbError> {
        self.pg_count_attachments_by_state().await
    }

    // -- Products --
    async fn replace_products(
        &self,
        attachment_id: i64,
        products: &[CreateProduct],
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        self.pg_replace_products(attachment_id, products).await
    }
    async fn list_products(
        &self,
        attachment_id: i64,
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        self.pg_list_products(attachment_id).await
    }
}
