use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use super::pg_err;
use crate::DbError;

/// Fixed key for the advisory lock that serialises migration runs.
pub const MIGRATION_LOCK_KEY: i64 = 0x6865_6477_6967_0001; // "hedwig" + 1

/// Apply pending migrations. Advisory locks belong to a session, so the lock,
/// the migrations and the unlock all run on one pooled connection.
pub async fn run(pool: &PgPool) -> Result<(), DbError> {
    let mut conn = pool.acquire().await.map_err(pg_err)?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;

    let result = run_inner(&mut conn).await;

    // Release even on error.
    let unlocked: Result<bool, DbError> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await
        .map_err(pg_err);

    match unlocked {
        Ok(true) => result,
        Ok(false) => {
            warn!("postgres: migration lock was not held at release");
            result
        }
        Err(e) => {
            // Closing the session drops its advisory locks.
            warn!("postgres: cannot release migration lock, closing connection: {e}");
            drop(conn.detach());
            result.and(Err(e))
        }
    }
}

async fn run_inner(conn: &mut PgConnection) -> Result<(), DbError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(pg_err)?;

    let current: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(&mut *conn)
        .await
        .map_err(pg_err)?;

    if current < 1 {
        sqlx::raw_sql(include_str!("sql/V1__attachments.sql"))
            .execute(&mut *conn)
            .await
            .map_err(pg_err)?;
        info!("postgres: applied migration v1 (attachments)");
    }

    if current < 2 {
        sqlx::raw_sql(include_str!("sql/V2__attachment_products.sql"))
            .execute(&mut *conn)
            .await
            .map_err(pg_err)?;
        info!("postgres: applied migration v2 (attachment_products)");
    }

    Ok(())
}
