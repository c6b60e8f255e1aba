use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use hedwig_core::attachment::{
    Attachment, AttachmentFilter, AttachmentKind, CreateAttachment, OwnerRef, OwnerType,
};
use hedwig_core::state::{AttachmentState, Transition};

use super::super::{map_sqlite_err, SqliteDatabase, SqliteResultExt};
use super::parse_text_col;
use crate::{invalid_transition, DbError, StateCount};

fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
    let owner_type = parse_text_col(row, "owner_type", OwnerType::parse_str)?;
    Ok(Attachment {
        id: row.get("id")?,
        kind: parse_text_col(row, "kind", AttachmentKind::parse_str)?,
        owner: OwnerRef::new(owner_type, row.get("owner_id")?),
        filename: row.get("filename")?,
        store_key: row.get("store_key")?,
        size_bytes: row.get("size_bytes")?,
        checksum: row.get("checksum")?,
        state: parse_text_col(row, "state", AttachmentState::parse_str)?,
        state_message: row.get("state_message")?,
        uploaded_at: row.get("uploaded_at")?,
        state_changed_at: row.get("state_changed_at")?,
    })
}

fn fetch(conn: &Connection, id: i64) -> Result<Attachment, DbError> {
    conn.query_row(
        "SELECT * FROM attachments WHERE id = ?1",
        params![id],
        row_to_attachment,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("attachment {id}")),
        other => map_sqlite_err(other),
    })
}

/// `'a', 'b'` list of the legal source states of a transition.
fn source_states_sql(transition: Transition) -> String {
    AttachmentState::sources_for(transition)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteDatabase {
    pub fn create_attachment_sync(&self, input: &CreateAttachment) -> Result<Attachment, DbError> {
        input.validate()?;
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO attachments (kind, owner_type, owner_id, filename, store_key,
                                          size_bytes, checksum, state, uploaded_at, state_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'new', ?8, ?8)",
                params![
                    input.kind.as_str(),
                    input.owner.owner_type().as_str(),
                    input.owner.id(),
                    input.filename,
                    input.store_key,
                    input.size_bytes,
                    input.checksum,
                    now,
                ],
            )
            .to_db()?;
            fetch(conn, conn.last_insert_rowid())
        })
    }

    pub fn get_attachment_sync(&self, id: i64) -> Result<Attachment, DbError> {
        self.with_conn(|conn| fetch(conn, id))
    }

    pub fn list_attachments_sync(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<Vec<Attachment>, DbError> {
        self.with_conn(|conn| {
            let mut sql = String::from("SELECT * FROM attachments WHERE 1=1");
            let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(kind) = filter.kind {
                param_values.push(Box::new(kind.as_str().to_string()));
                sql.push_str(&format!(" AND kind = ?{}", param_values.len()));
            }
            if let Some(state) = filter.state {
                param_values.push(Box::new(state.as_str().to_string()));
                sql.push_str(&format!(" AND state = ?{}", param_values.len()));
            }
            if let Some(owner) = filter.owner {
                param_values.push(Box::new(owner.owner_type().as_str().to_string()));
                sql.push_str(&format!(" AND owner_type = ?{}", param_values.len()));
                param_values.push(Box::new(owner.id()));
                sql.push_str(&format!(" AND owner_id = ?{}", param_values.len()));
            }

            sql.push_str(" ORDER BY id ASC");

            if let Some(limit) = filter.limit {
                param_values.push(Box::new(limit));
                sql.push_str(&format!(" LIMIT ?{}", param_values.len()));
            }

            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                param_values.iter().map(|p| p.as_ref()).collect();

            let mut stmt = conn.prepare(&sql).to_db()?;
            let attachments = stmt
                .query_map(params_ref.as_slice(), row_to_attachment)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(attachments)
        })
    }

    pub fn delete_attachment_sync(&self, id: i64) -> Result<Attachment, DbError> {
        self.with_conn(|conn| {
            let attachment = fetch(conn, id)?;
            conn.execute("DELETE FROM attachments WHERE id = ?1", params![id])
                .to_db()?;
            Ok(attachment)
        })
    }

    pub fn list_new_attachments_sync(
        &self,
        kind: AttachmentKind,
    ) -> Result<Vec<Attachment>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM attachments WHERE kind = ?1 AND state = 'new' ORDER BY id ASC",
                )
                .to_db()?;
            let attachments = stmt
                .query_map(params![kind.as_str()], row_to_attachment)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(attachments)
        })
    }

    /// Conditionally move an attachment to `transition.target()`.
    /// The UPDATE only matches rows in a legal source state, so a lost race
    /// shows up as `InvalidTransition` rather than a silent overwrite.
    pub fn transition_attachment_sync(
        &self,
        id: i64,
        transition: Transition,
        message: Option<&str>,
    ) -> Result<Attachment, DbError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let sql = format!(
                "UPDATE attachments
                 SET state = ?1, state_message = ?2, state_changed_at = ?3
                 WHERE id = ?4 AND state IN ({})
                 RETURNING *",
                source_states_sql(transition)
            );
            let result = conn.query_row(
                &sql,
                params![transition.target().as_str(), message, now, id],
                row_to_attachment,
            );

            match result {
                Ok(attachment) => Ok(attachment),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    let current = fetch(conn, id)?;
                    Err(invalid_transition(id, current.state, transition))
                }
                Err(e) => Err(map_sqlite_err(e)),
            }
        })
    }

    pub fn find_stuck_attachments_sync(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Attachment>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM attachments
                     WHERE state = 'processing' AND state_changed_at < ?1
                     ORDER BY id ASC",
                )
                .to_db()?;
            let attachments = stmt
                .query_map(params![older_than], row_to_attachment)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(attachments)
        })
    }

    pub fn count_attachments_by_state_sync(&self) -> Result<Vec<StateCount>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT kind, state, COUNT(*) AS n FROM attachments
                     GROUP BY kind, state ORDER BY kind, state",
                )
                .to_db()?;
            let counts = stmt
                .query_map([], |row| {
                    Ok(StateCount {
                        kind: parse_text_col(row, "kind", AttachmentKind::parse_str)?,
                        state: parse_text_col(row, "state", AttachmentState::parse_str)?,
                        count: row.get("n")?,
                    })
                })
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(counts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedwig_core::attachment::checksum;

    fn setup() -> SqliteDatabase {
        SqliteDatabase::open_in_memory().unwrap()
    }

    fn upload(db: &SqliteDatabase, kind: AttachmentKind, owner: OwnerRef) -> Attachment {
        db.create_attachment_sync(&CreateAttachment {
            kind,
            owner,
            filename: "upload.bin".into(),
            store_key: "uploads/upload.bin".into(),
            size_bytes: 4,
            checksum: checksum(b"data"),
        })
        .unwrap()
    }

    #[test]
    fn test_create_starts_new() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        assert_eq!(a.state, AttachmentState::New);
        assert_eq!(a.owner, OwnerRef::Proposal(1));
        assert!(a.state_message.is_none());
        assert_eq!(a.uploaded_at, a.state_changed_at);
    }

    #[test]
    fn test_create_rejects_mismatched_owner() {
        let db = setup();
        let err = db
            .create_attachment_sync(&CreateAttachment {
                kind: AttachmentKind::ReviewFigure,
                owner: OwnerRef::Proposal(1),
                filename: "fig.png".into(),
                store_key: "k".into(),
                size_bytes: 1,
                checksum: checksum(b"x"),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[test]
    fn test_ids_ascend_in_upload_order() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalFigure, OwnerRef::Proposal(1));
        let b = upload(&db, AttachmentKind::ProposalFigure, OwnerRef::Proposal(2));
        let c = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(2));
        assert!(a.id < b.id && b.id < c.id);

        let new = db
            .list_new_attachments_sync(AttachmentKind::ProposalFigure)
            .unwrap();
        let ids: Vec<i64> = new.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_transition_guards() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));

        let err = db
            .transition_attachment_sync(a.id, Transition::Complete, None)
            .unwrap_err();
        match err {
            DbError::InvalidTransition { id, source } => {
                assert_eq!(id, a.id);
                assert_eq!(source.from, AttachmentState::New);
            }
            other => panic!("unexpected error: {other}"),
        }

        let claimed = db
            .transition_attachment_sync(a.id, Transition::Claim, None)
            .unwrap();
        assert_eq!(claimed.state, AttachmentState::Processing);

        // second claim loses
        assert!(db
            .transition_attachment_sync(a.id, Transition::Claim, None)
            .is_err());

        let failed = db
            .transition_attachment_sync(a.id, Transition::Fail, Some("gs exited 1"))
            .unwrap();
        assert_eq!(failed.state, AttachmentState::Error);
        assert_eq!(failed.state_message.as_deref(), Some("gs exited 1"));

        let reset = db
            .transition_attachment_sync(a.id, Transition::Reset, None)
            .unwrap();
        assert_eq!(reset.state, AttachmentState::New);
        assert!(reset.state_message.is_none());
    }

    #[test]
    fn test_transition_missing_is_not_found() {
        let db = setup();
        let err = db
            .transition_attachment_sync(999, Transition::Claim, None)
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[test]
    fn test_find_stuck() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        let _b = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        db.transition_attachment_sync(a.id, Transition::Claim, None)
            .unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let stuck = db.find_stuck_attachments_sync(future).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, a.id);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(db.find_stuck_attachments_sync(past).unwrap().is_empty());
    }

    #[test]
    fn test_count_by_state() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(2));
        upload(&db, AttachmentKind::ReviewFigure, OwnerRef::Review(5));
        db.transition_attachment_sync(a.id, Transition::Claim, None)
            .unwrap();

        let counts = db.count_attachments_by_state_sync().unwrap();
        let get = |kind, state| {
            counts
                .iter()
                .find(|c| c.kind == kind && c.state == state)
                .map(|c| c.count)
        };
        assert_eq!(get(AttachmentKind::ProposalPdf, AttachmentState::New), Some(1));
        assert_eq!(
            get(AttachmentKind::ProposalPdf, AttachmentState::Processing),
            Some(1)
        );
        assert_eq!(get(AttachmentKind::ReviewFigure, AttachmentState::New), Some(1));
        assert_eq!(get(AttachmentKind::ProposalCoverage, AttachmentState::New), None);
    }

    #[test]
    fn test_list_filter() {
        let db = setup();
        upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        upload(&db, AttachmentKind::ProposalFigure, OwnerRef::Proposal(1));
        upload(&db, AttachmentKind::ProposalFigure, OwnerRef::Proposal(2));

        let by_owner = db
            .list_attachments_sync(&AttachmentFilter {
                owner: Some(OwnerRef::Proposal(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_owner.len(), 2);

        let limited = db
            .list_attachments_sync(&AttachmentFilter {
                kind: Some(AttachmentKind::ProposalFigure),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].owner, OwnerRef::Proposal(1));
    }

    #[test]
    fn test_delete() {
        let db = setup();
        let a = upload(&db, AttachmentKind::ProposalPdf, OwnerRef::Proposal(1));
        let deleted = db.delete_attachment_sync(a.id).unwrap();
        assert_eq!(deleted.id, a.id);
        assert!(matches!(
            db.get_attachment_sync(a.id),
            Err(DbError::NotFound(_))
        ));
        assert!(matches!(
            db.delete_attachment_sync(a.id),
            Err(DbError::NotFound(_))
        ));
    }
}
