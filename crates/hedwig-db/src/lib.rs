#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use hedwig_core::attachment::{Attachment, AttachmentFilter, AttachmentKind, CreateAttachment};
use hedwig_core::product::{AttachmentProduct, CreateProduct};
use hedwig_core::state::{AttachmentState, Transition, TransitionError};
use hedwig_core::HedwigError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("attachment {id}: {source}")]
    InvalidTransition {
        id: i64,
        #[source]
        source: TransitionError,
    },

    #[error("database error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HedwigError> for DbError {
    fn from(e: HedwigError) -> Self {
        match e {
            HedwigError::NotFound(what) => DbError::NotFound(what),
            HedwigError::InvalidInput(msg) => DbError::InvalidInput(msg),
            other => DbError::Internal(other.to_string()),
        }
    }
}

/// Row count of attachments of one kind in one state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCount {
    pub kind: AttachmentKind,
    pub state: AttachmentState,
    pub count: i64,
}

/// Access to the attachment processing queue.
///
/// Every state change goes through [`Database::transition_attachment`], which
/// only matches rows currently in one of the transition's legal source states.
/// The poll process and the administrative commands program against this trait.
#[async_trait]
pub trait Database: Send + Sync {
    // -- Attachments --
    async fn create_attachment(&self, input: &CreateAttachment) -> Result<Attachment, DbError>;
    async fn get_attachment(&self, id: i64) -> Result<Attachment, DbError>;
    async fn list_attachments(&self, filter: &AttachmentFilter)
        -> Result<Vec<Attachment>, DbError>;
    async fn delete_attachment(&self, id: i64) -> Result<Attachment, DbError>;

    /// Attachments of `kind` in state `new`, in ascending id order.
    async fn list_new_attachments(&self, kind: AttachmentKind)
        -> Result<Vec<Attachment>, DbError>;

    /// Apply `transition` to the attachment, recording `message` as its state
    /// message. Fails with `InvalidTransition` if the row is not in a legal
    /// source state and with `NotFound` if it does not exist.
    async fn transition_attachment(
        &self,
        id: i64,
        transition: Transition,
        message: Option<&str>,
    ) -> Result<Attachment, DbError>;

    /// Attachments that have been `processing` since before `older_than`.
    async fn find_stuck_attachments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DbError>;

    async fn count_attachments_by_state(&self) -> Result<Vec<StateCount>, DbError>;

    // -- Products --
    /// Replace every product of the attachment with `products`.
    async fn replace_products(
        &self,
        attachment_id: i64,
        products: &[CreateProduct],
    ) -> Result<Vec<AttachmentProduct>, DbError>;
    async fn list_products(&self, attachment_id: i64)
        -> Result<Vec<AttachmentProduct>, DbError>;

    // -- Transition shorthands --

    /// Claim a new attachment for processing.
    /// Returns `None` if it is no longer `new`.
    async fn claim_attachment(&self, id: i64) -> Result<Option<Attachment>, DbError> {
        match self.transition_attachment(id, Transition::Claim, None).await {
            Ok(a) => Ok(Some(a)),
            Err(DbError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn complete_attachment(
        &self,
        id: i64,
        message: Option<&str>,
    ) -> Result<Attachment, DbError> {
        self.transition_attachment(id, Transition::Complete, message)
            .await
    }

    async fn fail_attachment(&self, id: i64, message: &str) -> Result<Attachment, DbError> {
        self.transition_attachment(id, Transition::Fail, Some(message))
            .await
    }

    async fn reset_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        self.transition_attachment(id, Transition::Reset, None).await
    }
}

/// Where the database lives.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Postgres connection URL. Takes precedence over `sqlite_path`.
    pub database_url: Option<String>,
    /// SQLite file path. Defaults to `<data_dir>/hedwig.db`.
    pub sqlite_path: Option<String>,
}

/// Open the configured backend.
pub async fn open_database(config: &DbConfig) -> Result<Arc<dyn Database>, DbError> {
    if let Some(url) = &config.database_url {
        #[cfg(feature = "postgres")]
        {
            return Ok(Arc::new(PostgresDatabase::connect(url).await?));
        }
        #[cfg(not(feature = "postgres"))]
        {
            let _ = url;
            return Err(DbError::InvalidInput(
                "DATABASE_URL is set but hedwig-db was built without the postgres feature"
                    .into(),
            ));
        }
    }

    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(SqliteDatabase::open(config)?))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Err(DbError::InvalidInput(
            "no database configured and the sqlite feature is disabled".into(),
        ))
    }
}

/// Default data directory: `$XDG_DATA_HOME/hedwig` or `~/.local/share/hedwig`.
pub fn data_dir() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from(".")
    };
    base.join("hedwig")
}

/// Build the `InvalidTransition` error for an attachment found in `from`.
pub(crate) fn invalid_transition(id: i64, from: AttachmentState, transition: Transition) -> DbError {
    DbError::InvalidTransition {
        id,
        source: TransitionError { from, transition },
    }
}
