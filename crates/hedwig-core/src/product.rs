use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file derived from an attachment by the poll process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductRole {
    PagePreview,
    Thumbnail,
    Preview,
    CoverageSummary,
}

impl ProductRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductRole::PagePreview => "page_preview",
            ProductRole::Thumbnail => "thumbnail",
            ProductRole::Preview => "preview",
            ProductRole::CoverageSummary => "coverage_summary",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "page_preview" => Some(ProductRole::PagePreview),
            "thumbnail" => Some(ProductRole::Thumbnail),
            "preview" => Some(ProductRole::Preview),
            "coverage_summary" => Some(ProductRole::CoverageSummary),
            _ => None,
        }
    }
}

impl fmt::Display for ProductRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentProduct {
    pub id: i64,
    pub attachment_id: i64,
    pub role: ProductRole,
    /// 1-based page number, only set for page previews.
    #[serde(default)]
    pub page: Option<i32>,
    pub store_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProduct {
    pub role: ProductRole,
    #[serde(default)]
    pub page: Option<i32>,
    pub store_key: String,
}
