mod local;

pub use local::LocalStore;

use std::path::{Component, Path};

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("store error: {0}")]
    Internal(String),
}

/// A store for uploaded content and derived products, keyed by relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (create or overwrite) an object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Read an object. Returns `StoreError::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Read an object, returning `None` if it does not exist.
    async fn get_opt(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.get(key).await {
            Ok(data) => Ok(Some(data)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an object. No-op if absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List object keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// -- Key helpers --

/// Key for uploaded content. Content is addressed by checksum so a re-upload
/// of the same bytes for the same owner reuses the object.
pub fn upload_key(kind: &str, owner_type: &str, owner_id: i64, checksum: &str, filename: &str) -> String {
    format!(
        "uploads/{kind}/{owner_type}-{owner_id}/{checksum}/{}",
        sanitize_filename(filename)
    )
}

/// Key for a product derived from an attachment. Each processing run writes
/// under its own `generation`, so a new set of products never overwrites the
/// set the database currently points at.
pub fn product_key(attachment_id: i64, generation: &str, name: &str) -> String {
    format!(
        "products/{attachment_id}/{}/{}",
        sanitize_filename(generation),
        sanitize_filename(name)
    )
}

/// Prefix holding every product of an attachment.
pub fn product_prefix(attachment_id: i64) -> String {
    format!("products/{attachment_id}")
}

/// Keep only the final path component and replace characters that do not
/// belong in a key.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Reject keys that could escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".into()));
    }
    let ok = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers_produce_expected_paths() {
        assert_eq!(
            upload_key("proposal_pdf", "proposal", 12, "abc123", "case.pdf"),
            "uploads/proposal_pdf/proposal-12/abc123/case.pdf"
        );
        assert_eq!(
            product_key(7, "1700000000000", "page-1.png"),
            "products/7/1700000000000/page-1.png"
        );
        assert_eq!(product_key(7, "g", "../x.png"), "products/7/g/x.png");
        assert_eq!(product_prefix(7), "products/7");
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\figs\\my fig (1).png"), "my_fig__1_.png");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("..."), "file");
    }

    #[test]
    fn validate_key_rejects_escapes() {
        assert!(validate_key("uploads/a/b.pdf").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../outside").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("uploads/./a").is_ok());
    }
}
