use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use hedwig_core::product::ProductRole;
use hedwig_core::{Attachment, AttachmentKind};

use super::{ProcessError, ProcessOutput, ProductFile, Processor};

/// A processor for tests: returns a preconfigured output, fails for chosen
/// file names, and records which attachments it saw.
pub struct MockProcessor {
    kind: AttachmentKind,
    output: ProcessOutput,
    fail_filenames: Vec<String>,
    panic_filenames: Vec<String>,
    seen: Mutex<Vec<i64>>,
}

impl MockProcessor {
    /// A mock that succeeds with the given summary and no products.
    pub fn success(kind: AttachmentKind, summary: &str) -> Self {
        Self {
            kind,
            output: ProcessOutput {
                summary: summary.to_string(),
                products: Vec::new(),
            },
            fail_filenames: Vec::new(),
            panic_filenames: Vec::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Add a product to every successful output.
    pub fn with_product(
        mut self,
        role: ProductRole,
        page: Option<i32>,
        name: &str,
        data: &str,
    ) -> Self {
        self.output.products.push(ProductFile {
            role,
            page,
            name: name.to_string(),
            data: Bytes::from(data.to_string()),
        });
        self
    }

    /// Fail attachments with this file name.
    pub fn failing_for(mut self, filename: &str) -> Self {
        self.fail_filenames.push(filename.to_string());
        self
    }

    /// Panic on attachments with this file name.
    pub fn panicking_for(mut self, filename: &str) -> Self {
        self.panic_filenames.push(filename.to_string());
        self
    }

    /// Attachment ids passed to `process`, in call order.
    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Processor for MockProcessor {
    fn kind(&self) -> AttachmentKind {
        self.kind
    }

    async fn process(
        &self,
        attachment: &Attachment,
        _content: Bytes,
    ) -> Result<ProcessOutput, ProcessError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(attachment.id);
        }
        if self.panic_filenames.contains(&attachment.filename) {
            panic!("mock processor panicked on {}", attachment.filename);
        }
        if self.fail_filenames.contains(&attachment.filename) {
            return Err(ProcessError::Invalid(format!(
                "mock failure for {}",
                attachment.filename
            )));
        }
        Ok(self.output.clone())
    }
}
