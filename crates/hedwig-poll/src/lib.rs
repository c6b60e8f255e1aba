pub mod admin;
pub mod config;
pub mod health;
pub mod pidfile;
pub mod poll;
pub mod processor;
pub mod tool;

use std::sync::Arc;

use hedwig_core::AttachmentKind;

use crate::config::ToolConfig;
use crate::processor::{CoverageProcessor, FigureProcessor, PdfProcessor, Processor};

/// The processor for each attachment kind.
pub fn default_processors(config: &ToolConfig) -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(PdfProcessor::new(config.clone())),
        Arc::new(FigureProcessor::new(
            AttachmentKind::ProposalFigure,
            config.clone(),
        )),
        Arc::new(FigureProcessor::new(
            AttachmentKind::ReviewFigure,
            config.clone(),
        )),
        Arc::new(CoverageProcessor),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_exactly_one_processor() {
        let processors = default_processors(&ToolConfig::default());
        let mut kinds: Vec<AttachmentKind> = processors.iter().map(|p| p.kind()).collect();
        kinds.sort();
        assert_eq!(kinds, AttachmentKind::ALL.to_vec());
    }
}
