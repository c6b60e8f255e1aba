use chrono::{DateTime, Utc};

use hedwig_core::attachment::{
    Attachment, AttachmentFilter, AttachmentKind, CreateAttachment, OwnerRef, OwnerType,
};
use hedwig_core::state::{AttachmentState, Transition};

use super::super::{pg_err, pg_not_found, PostgresDatabase};
use super::parse_col;
use crate::{invalid_transition, DbError, StateCount};

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: i64,
    kind: String,
    owner_type: String,
    owner_id: i64,
    filename: String,
    store_key: String,
    size_bytes: i64,
    checksum: String,
    state: String,
    state_message: Option<String>,
    uploaded_at: DateTime<Utc>,
    state_changed_at: DateTime<Utc>,
}

impl TryFrom<AttachmentRow> for Attachment {
    type Error = DbError;

    fn try_from(r: AttachmentRow) -> Result<Self, DbError> {
        let owner_type = parse_col("owner_type", &r.owner_type, OwnerType::parse_str)?;
        Ok(Attachment {
            id: r.id,
            kind: parse_col("kind", &r.kind, AttachmentKind::parse_str)?,
            owner: OwnerRef::new(owner_type, r.owner_id),
            filename: r.filename,
            store_key: r.store_key,
            size_bytes: r.size_bytes,
            checksum: r.checksum,
            state: parse_col("state", &r.state, AttachmentState::parse_str)?,
            state_message: r.state_message,
            uploaded_at: r.uploaded_at,
            state_changed_at: r.state_changed_at,
        })
    }
}

fn rows_into(rows: Vec<AttachmentRow>) -> Result<Vec<Attachment>, DbError> {
    rows.into_iter().map(Attachment::try_from).collect()
}

impl PostgresDatabase {
    pub(crate) async fn pg_create_attachment(
        &self,
        input: &CreateAttachment,
    ) -> Result<Attachment, DbError> {
        input.validate()?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, AttachmentRow>(
            "INSERT INTO attachments (kind, owner_type, owner_id, filename, store_key,
                                      size_bytes, checksum, state, uploaded_at, state_changed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'new', $8, $8)
             RETURNING *",
        )
        .bind(input.kind.as_str())
        .bind(input.owner.owner_type().as_str())
        .bind(input.owner.id())
        .bind(&input.filename)
        .bind(&input.store_key)
        .bind(input.size_bytes)
        .bind(&input.checksum)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        row.try_into()
    }

    pub(crate) async fn pg_get_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?
            .ok_or_else(|| pg_not_found(&format!("attachment {id}")))?;

        row.try_into()
    }

    pub(crate) async fn pg_list_attachments(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<Vec<Attachment>, DbError> {
        let mut sql = String::from("SELECT * FROM attachments WHERE 1=1");
        let mut param_idx = 1usize;

        if filter.kind.is_some() {
            sql.push_str(&format!(" AND kind = ${param_idx}"));
            param_idx += 1;
        }
        if filter.state.is_some() {
            sql.push_str(&format!(" AND state = ${param_idx}"));
            param_idx += 1;
        }
        if filter.owner.is_some() {
            sql.push_str(&format!(
                " AND owner_type = ${param_idx} AND owner_id = ${}",
                param_idx + 1
            ));
            param_idx += 2;
        }

        sql.push_str(" ORDER BY id ASC");

        if filter.limit.is_some() {
            sql.push_str(&format!(" LIMIT ${param_idx}"));
        }

        // Bind in the same order the placeholders were emitted.
        let mut query = sqlx::query_as::<_, AttachmentRow>(&sql);
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(owner) = filter.owner {
            query = query.bind(owner.owner_type().as_str()).bind(owner.id());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(pg_err)?;
        rows_into(rows)
    }

    pub(crate) async fn pg_delete_attachment(&self, id: i64) -> Result<Attachment, DbError> {
        let row = sqlx::query_as::<_, AttachmentRow>(
            "DELETE FROM attachments WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| pg_not_found(&format!("attachment {id}")))?;

        row.try_into()
    }

    pub(crate) async fn pg_list_new_attachments(
        &self,
        kind: AttachmentKind,
    ) -> Result<Vec<Attachment>, DbError> {
        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT * FROM attachments WHERE kind = $1 AND state = 'new' ORDER BY id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows_into(rows)
    }

    pub(crate) async fn pg_transition_attachment(
        &self,
        id: i64,
        transition: Transition,
        message: Option<&str>,
    ) -> Result<Attachment, DbError> {
        let sources: Vec<String> = AttachmentState::sources_for(transition)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, AttachmentRow>(
            "UPDATE attachments
             SET state = $1, state_message = $2, state_changed_at = $3
             WHERE id = $4 AND state = ANY($5)
             RETURNING *",
        )
        .bind(transition.target().as_str())
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .bind(&sources)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let current = self.pg_get_attachment(id).await?;
                Err(invalid_transition(id, current.state, transition))
            }
        }
    }

    pub(crate) async fn pg_find_stuck_attachments(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DbError> {
        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT * FROM attachments
             WHERE state = 'processing' AND state_changed_at < $1
             ORDER BY id ASC",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows_into(rows)
    }

    pub(crate) async fn pg_count_attachments_by_state(&self) -> Result<Vec<StateCount>, DbError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT kind, state, COUNT(*) FROM attachments
             GROUP BY kind, state ORDER BY kind, state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows.into_iter()
            .map(|(kind, state, count)| {
                Ok(StateCount {
                    kind: parse_col("kind", &kind, AttachmentKind::parse_str)?,
                    state: parse_col("state", &state, AttachmentState::parse_str)?,
                    count,
                })
            })
            .collect()
    }
}
