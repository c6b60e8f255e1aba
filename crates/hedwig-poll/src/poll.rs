use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use hedwig_core::product::CreateProduct;
use hedwig_core::{checksum, Attachment, AttachmentKind};
use hedwig_db::{Database, DbError};
use hedwig_store::{product_key, product_prefix, ObjectStore};

use crate::health::SharedTracker;
use crate::processor::{ProcessError, ProcessOutput, Processor};

/// Longest state message stored for a failed attachment.
pub const MAX_ERROR_MESSAGE: usize = 1000;

/// Failures that abort a cycle rather than a single attachment.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("no processor registered for {0}")]
    NoProcessor(AttachmentKind),
}

/// Per-kind outcome of one cycle. In a dry run `ready` and `failed` count
/// what would have been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub kind: AttachmentKind,
    pub selected: usize,
    pub ready: usize,
    pub failed: usize,
    /// Selected but reset or deleted by someone else before the outcome
    /// could be recorded.
    pub skipped: usize,
}

impl KindReport {
    fn new(kind: AttachmentKind) -> Self {
        Self {
            kind,
            selected: 0,
            ready: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub dry_run: bool,
    pub kinds: Vec<KindReport>,
}

impl CycleReport {
    pub fn kind(&self, kind: AttachmentKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn selected(&self) -> usize {
        self.kinds.iter().map(|k| k.selected).sum()
    }

    pub fn ready(&self) -> usize {
        self.kinds.iter().map(|k| k.ready).sum()
    }

    pub fn failed(&self) -> usize {
        self.kinds.iter().map(|k| k.failed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.kinds.iter().map(|k| k.skipped).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub kinds: Vec<AttachmentKind>,
    /// Sleep between cycles. `None` runs a single cycle.
    pub pause: Option<Duration>,
    pub dry_run: bool,
}

/// Drains the attachment queue: selects `new` attachments of each enabled
/// kind in id order, claims them one at a time and hands them to the kind's
/// processor.
pub struct Poller {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    processors: BTreeMap<AttachmentKind, Arc<dyn Processor>>,
    tracker: Option<SharedTracker>,
}

impl Poller {
    pub fn new(db: Arc<dyn Database>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            db,
            store,
            processors: BTreeMap::new(),
            tracker: None,
        }
    }

    /// Register a processor for its kind, replacing any earlier one.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(processor.kind(), processor);
        self
    }

    pub fn with_tracker(mut self, tracker: SharedTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn processor(&self, kind: AttachmentKind) -> Option<Arc<dyn Processor>> {
        self.processors.get(&kind).cloned()
    }

    /// Check every processor the given kinds need.
    pub async fn preflight(&self, kinds: &[AttachmentKind]) -> anyhow::Result<()> {
        for &kind in kinds {
            let processor = self.processor(kind).ok_or(PollError::NoProcessor(kind))?;
            processor
                .preflight_check()
                .await
                .with_context(|| format!("preflight for {kind} failed"))?;
        }
        info!("all preflight checks passed");
        Ok(())
    }

    /// One pass over each kind. Per-attachment failures are recorded on the
    /// attachment; only database failures abort the cycle.
    pub async fn run_cycle(
        &self,
        kinds: &[AttachmentKind],
        dry_run: bool,
    ) -> Result<CycleReport, PollError> {
        let mut report = CycleReport {
            dry_run,
            kinds: Vec::with_capacity(kinds.len()),
        };
        for &kind in kinds {
            let processor = self.processor(kind).ok_or(PollError::NoProcessor(kind))?;
            report.kinds.push(self.poll_kind(kind, processor, dry_run).await?);
        }
        Ok(report)
    }

    /// Run cycles until one fails without a pause configured. With a pause a
    /// failed cycle is logged and retried after the pause.
    pub async fn run(&self, options: &PollOptions) -> anyhow::Result<()> {
        loop {
            match self.run_cycle(&options.kinds, options.dry_run).await {
                Ok(report) => {
                    info!(
                        "cycle done{}: {} selected, {} ready, {} failed, {} skipped",
                        if report.dry_run { " (dry run)" } else { "" },
                        report.selected(),
                        report.ready(),
                        report.failed(),
                        report.skipped()
                    );
                    self.track(|t| t.record_cycle(&report));
                }
                Err(e) => {
                    self.track(|t| t.record_failure(&e.to_string()));
                    if options.pause.is_none() {
                        return Err(e).context("poll cycle failed");
                    }
                    error!("poll cycle failed: {e}");
                }
            }

            match options.pause {
                Some(pause) => tokio::time::sleep(pause).await,
                None => return Ok(()),
            }
        }
    }

    fn track(&self, f: impl FnOnce(&mut crate::health::PollTracker)) {
        if let Some(tracker) = &self.tracker {
            let mut t = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut t);
        }
    }

    async fn poll_kind(
        &self,
        kind: AttachmentKind,
        processor: Arc<dyn Processor>,
        dry_run: bool,
    ) -> Result<KindReport, PollError> {
        let mut report = KindReport::new(kind);
        let pending = self.db.list_new_attachments(kind).await?;
        report.selected = pending.len();
        if pending.is_empty() {
            debug!("{kind}: nothing to do");
            return Ok(report);
        }
        info!("{kind}: {} new attachment(s)", pending.len());

        for attachment in pending {
            if dry_run {
                match self.attempt(&processor, &attachment).await {
                    Ok(output) => {
                        info!(
                            "[dry run] attachment {} would be ready: {}",
                            attachment.id, output.summary
                        );
                        report.ready += 1;
                    }
                    Err(e) => {
                        info!("[dry run] attachment {} would fail: {e}", attachment.id);
                        report.failed += 1;
                    }
                }
                continue;
            }

            let claimed = match self.db.claim_attachment(attachment.id).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) | Err(DbError::NotFound(_)) => {
                    debug!("attachment {} is no longer new, skipping", attachment.id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            info!(
                "claimed attachment {} ({kind}, {}, {})",
                claimed.id, claimed.owner, claimed.filename
            );

            let result = match self.attempt(&processor, &claimed).await {
                Ok(output) => self
                    .write_products(&claimed, &output)
                    .await
                    .map(|products| (output.summary, products)),
                Err(e) => Err(e),
            };

            match result {
                Ok((summary, products)) => {
                    let recorded = match self.db.replace_products(claimed.id, &products).await {
                        Ok(_) => {
                            self.remove_stale_products(claimed.id, &products).await;
                            self.db
                                .complete_attachment(claimed.id, Some(&summary))
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    match recorded {
                        Ok(_) => {
                            info!("attachment {} ready: {summary}", claimed.id);
                            report.ready += 1;
                        }
                        Err(DbError::InvalidTransition { source, .. }) => {
                            warn!(
                                "attachment {} changed state while processing: {source}",
                                claimed.id
                            );
                            report.skipped += 1;
                        }
                        Err(DbError::NotFound(_)) => {
                            warn!("attachment {} was deleted while processing", claimed.id);
                            self.discard_products(claimed.id, &products).await;
                            report.skipped += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    let message = truncate_message(&e.to_string());
                    warn!("attachment {} failed: {message}", claimed.id);
                    match self.db.fail_attachment(claimed.id, &message).await {
                        Ok(_) => report.failed += 1,
                        Err(DbError::InvalidTransition { source, .. }) => {
                            warn!(
                                "attachment {} changed state while processing: {source}",
                                claimed.id
                            );
                            report.skipped += 1;
                        }
                        Err(DbError::NotFound(_)) => {
                            warn!("attachment {} was deleted while processing", claimed.id);
                            report.skipped += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(report)
    }

    /// Fetch and verify the content, then run the processor on its own task
    /// so a panic becomes an error on this attachment.
    async fn attempt(
        &self,
        processor: &Arc<dyn Processor>,
        attachment: &Attachment,
    ) -> Result<ProcessOutput, ProcessError> {
        let content = self.fetch_content(attachment).await?;
        let processor = Arc::clone(processor);
        let owned = attachment.clone();
        tokio::spawn(async move { processor.process(&owned, content).await })
            .await
            .unwrap_or_else(|e| {
                Err(ProcessError::Invalid(format!(
                    "processor crashed: {}",
                    panic_message(e)
                )))
            })
    }

    async fn fetch_content(&self, attachment: &Attachment) -> Result<Bytes, ProcessError> {
        let content = self.store.get(&attachment.store_key).await?;
        let actual = checksum(&content);
        if !actual.eq_ignore_ascii_case(&attachment.checksum) {
            return Err(ProcessError::ChecksumMismatch {
                expected: attachment.checksum.clone(),
                actual,
            });
        }
        Ok(content)
    }

    /// Write products under a generation private to this run, keyed by the
    /// claim time.
    async fn write_products(
        &self,
        attachment: &Attachment,
        output: &ProcessOutput,
    ) -> Result<Vec<CreateProduct>, ProcessError> {
        let generation = attachment.state_changed_at.timestamp_millis().to_string();
        let mut products = Vec::with_capacity(output.products.len());
        for file in &output.products {
            let key = product_key(attachment.id, &generation, &file.name);
            self.store.put(&key, file.data.clone()).await?;
            products.push(CreateProduct {
                role: file.role,
                page: file.page,
                store_key: key,
            });
        }
        Ok(products)
    }

    /// Delete product objects the database no longer references. Leftovers
    /// only cost disk space, so failures are logged.
    async fn remove_stale_products(&self, attachment_id: i64, current: &[CreateProduct]) {
        let keys = match self.store.list(&product_prefix(attachment_id)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("attachment {attachment_id}: cannot list old products: {e}");
                return;
            }
        };
        for key in keys {
            if current.iter().any(|p| p.store_key == key) {
                continue;
            }
            if let Err(e) = self.store.delete(&key).await {
                warn!("attachment {attachment_id}: cannot delete {key}: {e}");
            }
        }
    }

    /// Delete the objects this run wrote for an attachment that no longer
    /// exists.
    async fn discard_products(&self, attachment_id: i64, written: &[CreateProduct]) {
        for product in written {
            if let Err(e) = self.store.delete(&product.store_key).await {
                warn!(
                    "attachment {attachment_id}: cannot delete {}: {e}",
                    product.store_key
                );
            }
        }
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Cut `message` to at most [`MAX_ERROR_MESSAGE`] characters.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
