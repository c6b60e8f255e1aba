use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HedwigError;
use crate::state::AttachmentState;

/// What an attachment is, which also decides the poll task that processes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    ProposalPdf,
    ProposalFigure,
    ReviewFigure,
    ProposalCoverage,
}

impl AttachmentKind {
    pub const ALL: &[AttachmentKind] = &[
        AttachmentKind::ProposalPdf,
        AttachmentKind::ProposalFigure,
        AttachmentKind::ReviewFigure,
        AttachmentKind::ProposalCoverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::ProposalPdf => "proposal_pdf",
            AttachmentKind::ProposalFigure => "proposal_figure",
            AttachmentKind::ReviewFigure => "review_figure",
            AttachmentKind::ProposalCoverage => "proposal_coverage",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "proposal_pdf" => Some(AttachmentKind::ProposalPdf),
            "proposal_figure" => Some(AttachmentKind::ProposalFigure),
            "review_figure" => Some(AttachmentKind::ReviewFigure),
            "proposal_coverage" => Some(AttachmentKind::ProposalCoverage),
            _ => None,
        }
    }

    /// The type of entity allowed to own this kind of attachment.
    pub fn owner_type(&self) -> OwnerType {
        match self {
            AttachmentKind::ReviewFigure => OwnerType::Review,
            _ => OwnerType::Proposal,
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Proposal,
    Review,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Proposal => "proposal",
            OwnerType::Review => "review",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "proposal" => Some(OwnerType::Proposal),
            "review" => Some(OwnerType::Review),
            _ => None,
        }
    }
}

/// The proposal or review an attachment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    Proposal(i64),
    Review(i64),
}

impl OwnerRef {
    pub fn new(owner_type: OwnerType, id: i64) -> Self {
        match owner_type {
            OwnerType::Proposal => OwnerRef::Proposal(id),
            OwnerType::Review => OwnerRef::Review(id),
        }
    }

    pub fn owner_type(&self) -> OwnerType {
        match self {
            OwnerRef::Proposal(_) => OwnerType::Proposal,
            OwnerRef::Review(_) => OwnerType::Review,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            OwnerRef::Proposal(id) | OwnerRef::Review(id) => *id,
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.owner_type().as_str(), self.id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub kind: AttachmentKind,
    pub owner: OwnerRef,
    pub filename: String,
    pub store_key: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub state: AttachmentState,
    #[serde(default)]
    pub state_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAttachment {
    pub kind: AttachmentKind,
    pub owner: OwnerRef,
    pub filename: String,
    pub store_key: String,
    pub size_bytes: i64,
    pub checksum: String,
}

impl CreateAttachment {
    pub fn validate(&self) -> Result<(), HedwigError> {
        if self.owner.owner_type() != self.kind.owner_type() {
            return Err(HedwigError::InvalidInput(format!(
                "{} cannot be attached to a {}",
                self.kind,
                self.owner.owner_type().as_str()
            )));
        }
        if self.filename.trim().is_empty() {
            return Err(HedwigError::InvalidInput("empty filename".into()));
        }
        if self.store_key.is_empty() {
            return Err(HedwigError::InvalidInput("empty store key".into()));
        }
        if self.size_bytes < 0 {
            return Err(HedwigError::InvalidInput("negative size".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentFilter {
    pub kind: Option<AttachmentKind>,
    pub state: Option<AttachmentState>,
    pub owner: Option<OwnerRef>,
    pub limit: Option<i64>,
}

/// SHA-256 of uploaded content, hex-encoded.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(kind: AttachmentKind, owner: OwnerRef) -> CreateAttachment {
        CreateAttachment {
            kind,
            owner,
            filename: "fig.png".into(),
            store_key: "attachments/1/fig.png".into(),
            size_bytes: 10,
            checksum: checksum(b"0123456789"),
        }
    }

    #[test]
    fn kind_parse_str_all() {
        for k in AttachmentKind::ALL {
            assert_eq!(AttachmentKind::parse_str(k.as_str()), Some(*k));
            assert_eq!(format!("{k}"), k.as_str());
        }
        assert_eq!(AttachmentKind::parse_str("pdf"), None);
        assert_eq!(AttachmentKind::parse_str(""), None);
    }

    #[test]
    fn review_figure_owned_by_review() {
        assert!(create(AttachmentKind::ReviewFigure, OwnerRef::Review(3))
            .validate()
            .is_ok());
        assert!(create(AttachmentKind::ReviewFigure, OwnerRef::Proposal(3))
            .validate()
            .is_err());
        assert!(create(AttachmentKind::ProposalPdf, OwnerRef::Review(3))
            .validate()
            .is_err());
    }

    #[test]
    fn validate_rejects_empty_filename() {
        let mut input = create(AttachmentKind::ProposalFigure, OwnerRef::Proposal(1));
        input.filename = "  ".into();
        assert!(matches!(input.validate(), Err(HedwigError::InvalidInput(_))));
    }

    #[test]
    fn owner_ref_serde_shape() {
        let json = serde_json::to_string(&OwnerRef::Review(7)).unwrap();
        assert_eq!(json, r#"{"type":"review","id":7}"#);
        let back: OwnerRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OwnerRef::Review(7));
    }

    #[test]
    fn owner_ref_display() {
        assert_eq!(OwnerRef::Proposal(12).to_string(), "proposal 12");
    }

    #[test]
    fn checksum_known_vector() {
        assert_eq!(
            checksum(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
