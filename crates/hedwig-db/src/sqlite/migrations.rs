use rusqlite::Connection;
use tracing::info;

use super::SqliteResultExt;
use crate::DbError;

pub(crate) const LATEST_VERSION: i64 = 2;

pub fn run(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .to_db()?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        // v1: attachment queue
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attachments (
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 kind             TEXT NOT NULL
                                      CHECK(kind IN ('proposal_pdf', 'proposal_figure',
                                                     'review_figure', 'proposal_coverage')),
                 owner_type       TEXT NOT NULL CHECK(owner_type IN ('proposal', 'review')),
                 owner_id         INTEGER NOT NULL,
                 filename         TEXT NOT NULL,
                 store_key        TEXT NOT NULL,
                 size_bytes       INTEGER NOT NULL DEFAULT 0,
                 checksum         TEXT NOT NULL,
                 state            TEXT NOT NULL DEFAULT 'new'
                                      CHECK(state IN ('new', 'processing', 'ready', 'error')),
                 state_message    TEXT,
                 uploaded_at      TEXT NOT NULL,
                 state_changed_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_attachments_kind_state
                 ON attachments(kind, state, id);
             CREATE INDEX IF NOT EXISTS idx_attachments_owner
                 ON attachments(owner_type, owner_id);

             INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));",
        )
        .to_db()?;
        info!("sqlite: applied migration v1 (attachments)");
    }

    if current_version < 2 {
        // v2: derived products
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attachment_products (
                 id             INTEGER PRIMARY KEY AUTOINCREMENT,
                 attachment_id  INTEGER NOT NULL REFERENCES attachments(id) ON DELETE CASCADE,
                 role           TEXT NOT NULL
                                    CHECK(role IN ('page_preview', 'thumbnail',
                                                   'preview', 'coverage_summary')),
                 page           INTEGER,
                 store_key      TEXT NOT NULL,
                 created_at     TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_products_attachment
                 ON attachment_products(attachment_id, role, page);

             INSERT INTO schema_version (version, applied_at) VALUES (2, datetime('now'));",
        )
        .to_db()?;
        info!("sqlite: applied migration v2 (attachment_products)");
    }

    Ok(())
}
