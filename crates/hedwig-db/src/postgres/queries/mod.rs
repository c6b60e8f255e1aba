pub mod attachments;
pub mod products;

use crate::DbError;

/// Decode an enum column stored as text.
pub(crate) fn parse_col<T>(col: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Result<T, DbError> {
    parse(raw).ok_or_else(|| DbError::Internal(format!("unexpected {col} value {raw:?}")))
}
