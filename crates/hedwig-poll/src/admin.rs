use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use tracing::{info, warn};

use hedwig_core::attachment::CreateAttachment;
use hedwig_core::{checksum, Attachment, AttachmentKind, AttachmentState, OwnerRef};
use hedwig_db::{Database, DbError, StateCount};
use hedwig_store::{upload_key, ObjectStore};

/// Store a local file and register it as a `new` attachment.
pub async fn enqueue(
    db: &dyn Database,
    store: &dyn ObjectStore,
    kind: AttachmentKind,
    owner: OwnerRef,
    file: &Path,
) -> Result<Attachment> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let sum = checksum(&data);
    let input = CreateAttachment {
        kind,
        owner,
        store_key: upload_key(
            kind.as_str(),
            owner.owner_type().as_str(),
            owner.id(),
            &sum,
            &filename,
        ),
        filename,
        size_bytes: data.len() as i64,
        checksum: sum,
    };
    // Validate before writing content so a rejected upload leaves nothing behind.
    input.validate()?;

    store.put(&input.store_key, Bytes::from(data)).await?;
    let attachment = db.create_attachment(&input).await?;
    info!(
        "enqueued attachment {} ({kind}, {owner}, {})",
        attachment.id, attachment.filename
    );
    Ok(attachment)
}

pub async fn reset(db: &dyn Database, id: i64) -> Result<Attachment> {
    let attachment = db
        .reset_attachment(id)
        .await
        .with_context(|| format!("cannot reset attachment {id}"))?;
    info!("attachment {id} reset to new");
    Ok(attachment)
}

/// Age after which a `processing` attachment counts as stuck.
pub fn stuck_age(minutes: i64) -> Result<TimeDelta> {
    if minutes < 0 {
        bail!("stuck threshold must not be negative, got {minutes} minutes");
    }
    TimeDelta::try_minutes(minutes)
        .with_context(|| format!("stuck threshold of {minutes} minutes is out of range"))
}

/// Reset every attachment that has been `processing` for longer than
/// `older_than`. Attachments that finish in the meantime are left alone.
pub async fn reset_stuck(db: &dyn Database, older_than: TimeDelta) -> Result<Vec<Attachment>> {
    let threshold = Utc::now()
        .checked_sub_signed(older_than)
        .with_context(|| format!("stuck threshold {older_than} is out of range"))?;
    let stuck = db.find_stuck_attachments(threshold).await?;
    let mut reset = Vec::with_capacity(stuck.len());
    for attachment in stuck {
        warn!(
            "resetting stuck attachment {} ({}, processing since {})",
            attachment.id, attachment.kind, attachment.state_changed_at
        );
        match db.reset_attachment(attachment.id).await {
            Ok(a) => reset.push(a),
            Err(DbError::InvalidTransition { source, .. }) => {
                info!("attachment {} no longer stuck: {source}", attachment.id);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(reset)
}

/// Counts as a kind × state table.
pub fn format_status(counts: &[StateCount]) -> String {
    let mut by_kind: BTreeMap<AttachmentKind, BTreeMap<&'static str, i64>> = BTreeMap::new();
    for c in counts {
        *by_kind
            .entry(c.kind)
            .or_default()
            .entry(c.state.as_str())
            .or_default() += c.count;
    }

    let mut out = format!("{:<18}", "kind");
    for state in AttachmentState::ALL {
        out.push_str(&format!(" {:>10}", state.as_str()));
    }
    out.push('\n');
    for kind in AttachmentKind::ALL {
        let row = by_kind.get(kind);
        out.push_str(&format!("{:<18}", kind.as_str()));
        for state in AttachmentState::ALL {
            let n = row
                .and_then(|r| r.get(state.as_str()))
                .copied()
                .unwrap_or(0);
            out.push_str(&format!(" {n:>10}"));
        }
        out.push('\n');
    }
    out
}

pub fn format_attachment(a: &Attachment) -> String {
    let mut line = format!(
        "{:>6}  {:<17} {:<14} {:<10} {}  {}",
        a.id,
        a.kind.as_str(),
        a.owner.to_string(),
        a.state.as_str(),
        a.state_changed_at.format("%Y-%m-%d %H:%M:%S"),
        a.filename
    );
    if let Some(msg) = &a.state_message {
        line.push_str(&format!("  [{msg}]"));
    }
    line
}
