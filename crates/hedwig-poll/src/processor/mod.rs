pub mod coverage;
pub mod figure;
pub mod mock;
pub mod pdf;

pub use coverage::CoverageProcessor;
pub use figure::FigureProcessor;
pub use mock::MockProcessor;
pub use pdf::PdfProcessor;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use hedwig_core::product::ProductRole;
use hedwig_core::{Attachment, AttachmentKind};

/// Why a single attachment could not be processed. Every variant ends with
/// the attachment in `error`; none of them stop the poll cycle.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The content is not something this processor accepts.
    #[error("{0}")]
    Invalid(String),

    #[error("checksum mismatch: expected {expected}, content has {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] hedwig_store::StoreError),
}

/// A derived file, not yet written to the store.
#[derive(Debug, Clone)]
pub struct ProductFile {
    pub role: ProductRole,
    pub page: Option<i32>,
    /// File name under the attachment's product prefix.
    pub name: String,
    pub data: Bytes,
}

/// Result of processing one attachment.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Short description recorded as the state message, e.g. "3 pages".
    pub summary: String,
    pub products: Vec<ProductFile>,
}

/// Processing strategy for one attachment kind.
///
/// Processors are handed the verified content and return products in memory;
/// storing products and moving the attachment between states is the poller's
/// job.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The attachment kind this processor handles.
    fn kind(&self) -> AttachmentKind;

    /// Check external tools once, before the poll loop starts.
    async fn preflight_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        attachment: &Attachment,
        content: Bytes,
    ) -> Result<ProcessOutput, ProcessError>;
}
