use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use hedwig_core::product::ProductRole;
use hedwig_core::{Attachment, AttachmentKind};

use super::{ProcessError, ProcessOutput, ProductFile, Processor};
use crate::config::ToolConfig;
use crate::tool::{run_tool, tool_version};

const INPUT_NAME: &str = "input.pdf";

/// Counts and renders the pages of proposal PDFs with Ghostscript.
pub struct PdfProcessor {
    config: ToolConfig,
}

impl PdfProcessor {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    async fn page_count(&self, work_dir: &Path) -> Result<u32, ProcessError> {
        let program = format!("({INPUT_NAME}) (r) file runpdfbegin pdfpagecount = quit");
        let permit = format!("--permit-file-read={INPUT_NAME}");
        let output = run_tool(
            &self.config.gs,
            page_count_args(&permit, &program),
            work_dir,
            self.config.timeout(),
            self.config.kill_grace(),
        )
        .await?;
        parse_page_count(&output.stdout)
    }

    async fn render_pages(
        &self,
        work_dir: &Path,
        pages: u32,
    ) -> Result<Vec<ProductFile>, ProcessError> {
        let resolution = format!("-r{}", self.config.resolution);
        let last_page = format!("-dLastPage={pages}");
        run_tool(
            &self.config.gs,
            [
                "-q",
                "-dSAFER",
                "-dNOPAUSE",
                "-dBATCH",
                "-sDEVICE=png16m",
                "-dTextAlphaBits=4",
                "-dGraphicsAlphaBits=4",
                resolution.as_str(),
                "-dFirstPage=1",
                last_page.as_str(),
                "-sOutputFile=page-%d.png",
                INPUT_NAME,
            ],
            work_dir,
            self.config.timeout(),
            self.config.kill_grace(),
        )
        .await?;

        let mut products = Vec::with_capacity(pages as usize);
        for page in 1..=pages {
            let name = format!("page-{page}.png");
            let data = tokio::fs::read(work_dir.join(&name)).await.map_err(|e| {
                ProcessError::Tool {
                    tool: self.config.gs.clone(),
                    message: format!("page {page} was not rendered: {e}"),
                }
            })?;
            products.push(ProductFile {
                role: ProductRole::PagePreview,
                page: Some(page as i32),
                name,
                data: Bytes::from(data),
            });
        }
        Ok(products)
    }
}

#[async_trait]
impl Processor for PdfProcessor {
    fn kind(&self) -> AttachmentKind {
        AttachmentKind::ProposalPdf
    }

    async fn preflight_check(&self) -> anyhow::Result<()> {
        let version = tool_version(&self.config.gs, "--version")
            .await
            .with_context(|| format!("Ghostscript ({}) is not usable", self.config.gs))?;
        info!("gs: {version}");
        Ok(())
    }

    async fn process(
        &self,
        attachment: &Attachment,
        content: Bytes,
    ) -> Result<ProcessOutput, ProcessError> {
        check_pdf_header(&content)?;

        let work_dir = tempfile::Builder::new().prefix("hedwig-pdf-").tempdir()?;
        tokio::fs::write(work_dir.path().join(INPUT_NAME), &content).await?;

        let pages = self.page_count(work_dir.path()).await?;
        check_page_limit(pages, self.config.pdf_max_pages)?;
        debug!("attachment {}: {pages} pages", attachment.id);

        let rendered = pages.min(self.config.pdf_preview_pages);
        let products = if rendered > 0 {
            self.render_pages(work_dir.path(), rendered).await?
        } else {
            Vec::new()
        };

        Ok(ProcessOutput {
            summary: page_summary(pages, rendered),
            products,
        })
    }
}

fn check_pdf_header(content: &[u8]) -> Result<(), ProcessError> {
    // The header may follow a little junk; readers accept it within the first KiB.
    let head = &content[..content.len().min(1024)];
    if head.windows(5).any(|w| w == b"%PDF-") {
        Ok(())
    } else {
        Err(ProcessError::Invalid("file is not a PDF".into()))
    }
}

/// Ghostscript arguments for counting pages. Uploads are untrusted, so the
/// count runs under SAFER with read access to the input file only.
fn page_count_args<'a>(permit: &'a str, program: &'a str) -> [&'a str; 8] {
    [
        "-q",
        "-dSAFER",
        permit,
        "-dNODISPLAY",
        "-dNOPAUSE",
        "-dBATCH",
        "-c",
        program,
    ]
}

/// Ghostscript prints the count on the last line; anything before it is
/// interpreter chatter about repaired files.
fn parse_page_count(stdout: &str) -> Result<u32, ProcessError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("");
    line.parse().map_err(|_| {
        ProcessError::Invalid(format!("could not determine page count (got {line:?})"))
    })
}

fn check_page_limit(pages: u32, max_pages: u32) -> Result<(), ProcessError> {
    if pages == 0 {
        return Err(ProcessError::Invalid("PDF has no pages".into()));
    }
    if pages > max_pages {
        return Err(ProcessError::Invalid(format!(
            "PDF has {pages} pages, the limit is {max_pages}"
        )));
    }
    Ok(())
}

fn page_summary(pages: u32, rendered: u32) -> String {
    let noun = if pages == 1 { "page" } else { "pages" };
    if rendered < pages {
        format!("{pages} {noun}, previews of the first {rendered}")
    } else {
        format!("{pages} {noun}")
    }
}
