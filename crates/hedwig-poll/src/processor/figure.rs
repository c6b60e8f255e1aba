use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use hedwig_core::product::ProductRole;
use hedwig_core::{Attachment, AttachmentKind};

use super::{ProcessError, ProcessOutput, ProductFile, Processor};
use crate::config::ToolConfig;
use crate::tool::{run_tool, tool_version};

/// Figure formats accepted for upload, detected from content rather than the
/// file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FigureFormat {
    Png,
    Jpeg,
    Gif,
    Pdf,
    Eps,
}

impl FigureFormat {
    pub fn detect(content: &[u8]) -> Option<Self> {
        if content.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(FigureFormat::Png)
        } else if content.starts_with(&[0xff, 0xd8, 0xff]) {
            Some(FigureFormat::Jpeg)
        } else if content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a") {
            Some(FigureFormat::Gif)
        } else if content.starts_with(b"%PDF-") {
            Some(FigureFormat::Pdf)
        } else if content.starts_with(b"%!PS") || content.starts_with(&[0xc5, 0xd0, 0xd3, 0xc6]) {
            // Plain EPS or the DOS binary EPS wrapper.
            Some(FigureFormat::Eps)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FigureFormat::Png => "png",
            FigureFormat::Jpeg => "jpg",
            FigureFormat::Gif => "gif",
            FigureFormat::Pdf => "pdf",
            FigureFormat::Eps => "eps",
        }
    }

    /// Vector formats are rasterised at the configured density and flattened
    /// onto white.
    pub fn is_vector(&self) -> bool {
        matches!(self, FigureFormat::Pdf | FigureFormat::Eps)
    }
}

/// Makes thumbnail and preview images of proposal and review figures with
/// ImageMagick.
pub struct FigureProcessor {
    kind: AttachmentKind,
    config: ToolConfig,
}

impl FigureProcessor {
    pub fn new(kind: AttachmentKind, config: ToolConfig) -> Self {
        Self { kind, config }
    }

    /// `convert [-density D] input[0] [-background white -flatten] <op> SxS> output`
    fn convert_args(
        &self,
        format: FigureFormat,
        input: &str,
        op: &str,
        size: u32,
        output: &str,
    ) -> Vec<String> {
        let mut args = Vec::new();
        if format.is_vector() {
            args.push("-density".to_string());
            args.push(self.config.resolution.to_string());
        }
        // [0]: first page of PDF/EPS, first frame of animated GIF.
        args.push(format!("{input}[0]"));
        if format.is_vector() {
            args.extend(["-background", "white", "-flatten"].map(String::from));
        }
        args.push(op.to_string());
        // '>' only ever shrinks.
        args.push(format!("{size}x{size}>"));
        args.push(output.to_string());
        args
    }

    async fn convert(
        &self,
        work_dir: &Path,
        args: Vec<String>,
        output: &str,
    ) -> Result<Bytes, ProcessError> {
        run_tool(
            &self.config.convert,
            &args,
            work_dir,
            self.config.timeout(),
            self.config.kill_grace(),
        )
        .await?;
        let data = tokio::fs::read(work_dir.join(output))
            .await
            .map_err(|e| ProcessError::Tool {
                tool: self.config.convert.clone(),
                message: format!("{output} was not written: {e}"),
            })?;
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl Processor for FigureProcessor {
    fn kind(&self) -> AttachmentKind {
        self.kind
    }

    async fn preflight_check(&self) -> anyhow::Result<()> {
        let version = tool_version(&self.config.convert, "-version")
            .await
            .with_context(|| format!("ImageMagick ({}) is not usable", self.config.convert))?;
        info!("convert: {version}");
        Ok(())
    }

    async fn process(
        &self,
        _attachment: &Attachment,
        content: Bytes,
    ) -> Result<ProcessOutput, ProcessError> {
        let format = FigureFormat::detect(&content).ok_or_else(|| {
            ProcessError::Invalid(
                "unrecognised figure format (expected PNG, JPEG, GIF, PDF or EPS)".into(),
            )
        })?;

        let work_dir = tempfile::Builder::new().prefix("hedwig-fig-").tempdir()?;
        let input = format!("input.{}", format.extension());
        tokio::fs::write(work_dir.path().join(&input), &content).await?;

        let thumbnail_args = self.convert_args(
            format,
            &input,
            "-thumbnail",
            self.config.thumbnail_size,
            "thumbnail.png",
        );
        let thumbnail = self
            .convert(work_dir.path(), thumbnail_args, "thumbnail.png")
            .await?;

        let preview_args = self.convert_args(
            format,
            &input,
            "-resize",
            self.config.preview_size,
            "preview.png",
        );
        let preview = self
            .convert(work_dir.path(), preview_args, "preview.png")
            .await?;

        Ok(ProcessOutput {
            summary: format!("{} figure", format.extension().to_uppercase()),
            products: vec![
                ProductFile {
                    role: ProductRole::Thumbnail,
                    page: None,
                    name: "thumbnail.png".into(),
                    data: thumbnail,
                },
                ProductFile {
                    role: ProductRole::Preview,
                    page: None,
                    name: "preview.png".into(),
                    data: preview,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use chrono::Utc;
    use hedwig_core::{checksum, AttachmentState, OwnerRef};

    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const EPS: &[u8] = b"%!PS-Adobe-3.0 EPSF-3.0\n";

    fn attachment(content: &[u8]) -> Attachment {
        let now = Utc::now();
        Attachment {
            id: 9,
            kind: AttachmentKind::ReviewFigure,
            owner: OwnerRef::Review(2),
            filename: "fig".into(),
            store_key: "uploads/review_figure/review-2/x/fig".into(),
            size_bytes: content.len() as i64,
            checksum: checksum(content),
            state: AttachmentState::Processing,
            state_message: None,
            uploaded_at: now,
            state_changed_at: now,
        }
    }

    /// A stand-in for convert that writes its arguments into the output file.
    fn fake_convert(dir: &Path) -> PathBuf {
        let path = dir.join("fake-convert");
        let script = r#"#!/bin/sh
for a in "$@"; do out="$a"; done
echo "$@" > "$out"
"#;
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn processor(convert: &Path) -> FigureProcessor {
        FigureProcessor::new(
            AttachmentKind::ReviewFigure,
            ToolConfig {
                convert: convert.to_string_lossy().into_owned(),
                thumbnail_size: 150,
                preview_size: 800,
                resolution: 72,
                ..ToolConfig::default()
            },
        )
    }

    #[test]
    fn detects_formats_from_content() {
        assert_eq!(FigureFormat::detect(PNG), Some(FigureFormat::Png));
        assert_eq!(
            FigureFormat::detect(&[0xff, 0xd8, 0xff, 0xe0]),
            Some(FigureFormat::Jpeg)
        );
        assert_eq!(FigureFormat::detect(b"GIF89a.."), Some(FigureFormat::Gif));
        assert_eq!(FigureFormat::detect(b"%PDF-1.4"), Some(FigureFormat::Pdf));
        assert_eq!(FigureFormat::detect(EPS), Some(FigureFormat::Eps));
        assert_eq!(
            FigureFormat::detect(&[0xc5, 0xd0, 0xd3, 0xc6, 0]),
            Some(FigureFormat::Eps)
        );
        assert_eq!(FigureFormat::detect(b"<svg>"), None);
        assert_eq!(FigureFormat::detect(b""), None);
    }

    #[test]
    fn raster_args_take_first_frame() {
        let p = processor(Path::new("convert"));
        let args = p.convert_args(FigureFormat::Gif, "input.gif", "-thumbnail", 150, "t.png");
        assert_eq!(args, vec!["input.gif[0]", "-thumbnail", "150x150>", "t.png"]);
    }

    #[test]
    fn vector_args_set_density_and_flatten() {
        let p = processor(Path::new("convert"));
        let args = p.convert_args(FigureFormat::Pdf, "input.pdf", "-resize", 800, "p.png");
        assert_eq!(
            args,
            vec![
                "-density",
                "72",
                "input.pdf[0]",
                "-background",
                "white",
                "-flatten",
                "-resize",
                "800x800>",
                "p.png"
            ]
        );
    }

    #[tokio::test]
    async fn produces_thumbnail_and_preview() {
        let tmp = tempfile::tempdir().unwrap();
        let convert = fake_convert(tmp.path());
        let out = processor(&convert)
            .process(&attachment(EPS), Bytes::from_static(EPS))
            .await
            .unwrap();
        assert_eq!(out.summary, "EPS figure");
        assert_eq!(out.products.len(), 2);

        let thumb = &out.products[0];
        assert_eq!(thumb.role, ProductRole::Thumbnail);
        assert_eq!(thumb.name, "thumbnail.png");
        let thumb_args = String::from_utf8_lossy(&thumb.data);
        assert!(thumb_args.contains("input.eps[0]"), "{thumb_args}");
        assert!(thumb_args.contains("-thumbnail 150x150>"), "{thumb_args}");

        let preview = &out.products[1];
        assert_eq!(preview.role, ProductRole::Preview);
        assert!(String::from_utf8_lossy(&preview.data).contains("-resize 800x800>"));
    }

    #[tokio::test]
    async fn unknown_format_is_invalid() {
        let p = processor(Path::new("/nonexistent/convert"));
        let err = p
            .process(&attachment(b"BM...."), Bytes::from_static(b"BM...."))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Invalid(_)));
    }

    #[tokio::test]
    async fn tool_failure_is_reported() {
        let p = processor(Path::new("/nonexistent/convert"));
        let err = p
            .process(&attachment(PNG), Bytes::from_static(PNG))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Tool { .. }), "{err}");
    }

    #[test]
    fn kind_is_configurable() {
        let p = FigureProcessor::new(AttachmentKind::ProposalFigure, ToolConfig::default());
        assert_eq!(p.kind(), AttachmentKind::ProposalFigure);
    }
}
