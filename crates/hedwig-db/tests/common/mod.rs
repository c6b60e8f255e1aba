// Backend-agnostic integration tests for the Database trait.
//
// Each public async function accepts `&dyn Database` so that the same logic
// can be exercised against both the SQLite and Postgres backends.

#![allow(dead_code)]

use hedwig_core::attachment::{
    checksum, AttachmentFilter, AttachmentKind, CreateAttachment, OwnerRef,
};
use hedwig_core::product::{CreateProduct, ProductRole};
use hedwig_core::state::AttachmentState;
use hedwig_db::{Database, DbError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_attachment(kind: AttachmentKind, owner: OwnerRef, name: &str) -> CreateAttachment {
    CreateAttachment {
        kind,
        owner,
        filename: name.to_string(),
        store_key: format!("uploads/{name}"),
        size_bytes: name.len() as i64,
        checksum: checksum(name.as_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Attachment tests
// ---------------------------------------------------------------------------

/// Create, get, list, delete.
pub async fn test_attachment_crud(db: &dyn Database) {
    let a = db
        .create_attachment(&make_attachment(
            AttachmentKind::ProposalPdf,
            OwnerRef::Proposal(10),
            "case.pdf",
        ))
        .await
        .unwrap();
    assert_eq!(a.state, AttachmentState::New);
    assert_eq!(a.kind, AttachmentKind::ProposalPdf);
    assert_eq!(a.owner, OwnerRef::Proposal(10));
    assert_eq!(a.checksum, checksum(b"case.pdf"));

    let fetched = db.get_attachment(a.id).await.unwrap();
    assert_eq!(fetched.id, a.id);
    assert_eq!(fetched.filename, "case.pdf");

    let all = db.list_attachments(&AttachmentFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);

    let deleted = db.delete_attachment(a.id).await.unwrap();
    assert_eq!(deleted.id, a.id);
    assert!(matches!(
        db.get_attachment(a.id).await,
        Err(DbError::NotFound(_))
    ));
}

/// Rejects a review figure owned by a proposal.
pub async fn test_owner_validation(db: &dyn Database) {
    let err = db
        .create_attachment(&make_attachment(
            AttachmentKind::ReviewFigure,
            OwnerRef::Proposal(1),
            "fig.png",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));
}

/// Filter by kind, state, owner, and limit.
pub async fn test_list_filtering(db: &dyn Database) {
    let p1 = OwnerRef::Proposal(1);
    let p2 = OwnerRef::Proposal(2);
    let a = db
        .create_attachment(&make_attachment(AttachmentKind::ProposalFigure, p1, "a.png"))
        .await
        .unwrap();
    db.create_attachment(&make_attachment(AttachmentKind::ProposalFigure, p2, "b.png"))
        .await
        .unwrap();
    db.create_attachment(&make_attachment(AttachmentKind::ProposalPdf, p1, "c.pdf"))
        .await
        .unwrap();
    db.claim_attachment(a.id).await.unwrap();

    let figures = db
        .list_attachments(&AttachmentFilter {
            kind: Some(AttachmentKind::ProposalFigure),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(figures.len(), 2);

    let processing = db
        .list_attachments(&AttachmentFilter {
            state: Some(AttachmentState::Processing),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, a.id);

    let owned = db
        .list_attachments(&AttachmentFilter {
            owner: Some(p1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(owned.len(), 2);

    let limited = db
        .list_attachments(&AttachmentFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
    assert!(limited[0].id < limited[1].id);
}

/// `list_new_attachments` only returns `new` rows of the kind, oldest first.
pub async fn test_new_selection_order(db: &dyn Database) {
    let owner = OwnerRef::Proposal(3);
    let mut ids = Vec::new();
    for name in ["1.png", "2.png", "3.png"] {
        let a = db
            .create_attachment(&make_attachment(AttachmentKind::ProposalFigure, owner, name))
            .await
            .unwrap();
        ids.push(a.id);
    }
    db.create_attachment(&make_attachment(AttachmentKind::ProposalPdf, owner, "x.pdf"))
        .await
        .unwrap();
    db.claim_attachment(ids[1]).await.unwrap();

    let new: Vec<i64> = db
        .list_new_attachments(AttachmentKind::ProposalFigure)
        .await
        .unwrap()
        .iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(new, vec![ids[0], ids[2]]);

    assert!(db
        .list_new_attachments(AttachmentKind::ProposalCoverage)
        .await
        .unwrap()
        .is_empty());
}

/// new -> processing -> ready; ready is terminal.
pub async fn test_lifecycle_ready(db: &dyn Database) {
    let a = db
        .create_attachment(&make_attachment(
            AttachmentKind::ProposalPdf,
            OwnerRef::Proposal(1),
            "ok.pdf",
        ))
        .await
        .unwrap();

    let claimed = db.claim_attachment(a.id).await.unwrap().unwrap();
    assert_eq!(claimed.state, AttachmentState::Processing);
    assert!(claimed.state_changed_at >= a.state_changed_at);

    // A second claim finds nothing to claim.
    assert!(db.claim_attachment(a.id).await.unwrap().is_none());

    let ready = db.complete_attachment(a.id, Some("2 pages")).await.unwrap();
    assert_eq!(ready.state, AttachmentState::Ready);
    assert_eq!(ready.state_message.as_deref(), Some("2 pages"));

    for result in [
        db.fail_attachment(a.id, "late failure").await,
        db.complete_attachment(a.id, None).await,
        db.reset_attachment(a.id).await,
    ] {
        match result {
            Err(DbError::InvalidTransition { source, .. }) => {
                assert_eq!(source.from, AttachmentState::Ready)
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }
    assert_eq!(
        db.get_attachment(a.id).await.unwrap().state,
        AttachmentState::Ready
    );
}

/// new -> processing -> error -> new (reset) -> processing.
pub async fn test_lifecycle_error_and_reset(db: &dyn Database) {
    let a = db
        .create_attachment(&make_attachment(
            AttachmentKind::ReviewFigure,
            OwnerRef::Review(4),
            "bad.png",
        ))
        .await
        .unwrap();

    // Cannot fail or reset a record nobody has claimed.
    assert!(db.fail_attachment(a.id, "nope").await.is_err());
    assert!(db.reset_attachment(a.id).await.is_err());

    db.claim_attachment(a.id).await.unwrap().unwrap();
    let failed = db.fail_attachment(a.id, "convert: no decode delegate").await.unwrap();
    assert_eq!(failed.state, AttachmentState::Error);
    assert_eq!(
        failed.state_message.as_deref(),
        Some("convert: no decode delegate")
    );

    // Error is terminal for the poll process.
    assert!(db.claim_attachment(a.id).await.unwrap().is_none());

    let reset = db.reset_attachment(a.id).await.unwrap();
    assert_eq!(reset.state, AttachmentState::New);
    assert!(reset.state_message.is_none());

    assert!(db.claim_attachment(a.id).await.unwrap().is_some());
}

/// A stuck `processing` record can be reset directly.
pub async fn test_reset_stuck(db: &dyn Database) {
    let a = db
        .create_attachment(&make_attachment(
            AttachmentKind::ProposalCoverage,
            OwnerRef::Proposal(9),
            "moc.txt",
        ))
        .await
        .unwrap();
    db.claim_attachment(a.id).await.unwrap().unwrap();

    let future = chrono::Utc::now() + chrono::Duration::hours(1);
    let stuck = db.find_stuck_attachments(future).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, a.id);

    let past = chrono::Utc::now() - chrono::Duration::hours(1);
    assert!(db.find_stuck_attachments(past).await.unwrap().is_empty());

    let reset = db.reset_attachment(a.id).await.unwrap();
    assert_eq!(reset.state, AttachmentState::New);
    assert!(db.find_stuck_attachments(future).await.unwrap().is_empty());
}

pub async fn test_transition_missing(db: &dyn Database) {
    assert!(matches!(
        db.claim_attachment(123_456).await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        db.reset_attachment(123_456).await,
        Err(DbError::NotFound(_))
    ));
}

pub async fn test_count_by_state(db: &dyn Database) {
    assert!(db.count_attachments_by_state().await.unwrap().is_empty());

    let owner = OwnerRef::Proposal(1);
    let a = db
        .create_attachment(&make_attachment(AttachmentKind::ProposalPdf, owner, "1.pdf"))
        .await
        .unwrap();
    db.create_attachment(&make_attachment(AttachmentKind::ProposalPdf, owner, "2.pdf"))
        .await
        .unwrap();
    db.claim_attachment(a.id).await.unwrap();
    db.fail_attachment(a.id, "broken").await.unwrap();

    let counts = db.count_attachments_by_state().await.unwrap();
    assert_eq!(counts.len(), 2);
    let total: i64 = counts.iter().map(|c| c.count).sum();
    assert_eq!(total, 2);
    assert!(counts
        .iter()
        .any(|c| c.state == AttachmentState::Error && c.count == 1));
}

// ---------------------------------------------------------------------------
// Product tests
// ---------------------------------------------------------------------------

pub async fn test_products(db: &dyn Database) {
    let a = db
        .create_attachment(&make_attachment(
            AttachmentKind::ProposalFigure,
            OwnerRef::Proposal(1),
            "fig.eps",
        ))
        .await
        .unwrap();
    assert!(db.list_products(a.id).await.unwrap().is_empty());

    let products = db
        .replace_products(
            a.id,
            &[
                CreateProduct {
                    role: ProductRole::Thumbnail,
                    page: None,
                    store_key: "p/thumb.png".into(),
                },
                CreateProduct {
                    role: ProductRole::Preview,
                    page: None,
                    store_key: "p/preview.png".into(),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(products.len(), 2);
    assert!(products.iter().all(|p| p.attachment_id == a.id));

    let replaced = db
        .replace_products(
            a.id,
            &[CreateProduct {
                role: ProductRole::Preview,
                page: None,
                store_key: "p/preview2.png".into(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].store_key, "p/preview2.png");
    assert_eq!(db.list_products(a.id).await.unwrap().len(), 1);

    assert!(matches!(
        db.replace_products(999_999, &[]).await,
        Err(DbError::NotFound(_))
    ));
}
