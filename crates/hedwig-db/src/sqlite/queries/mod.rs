pub mod attachments;
pub mod products;

use rusqlite::types::Type;

/// Decode an enum column stored as text, surfacing unknown values as a
/// conversion error instead of guessing.
pub(crate) fn parse_text_col<T>(
    row: &rusqlite::Row,
    col: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    let idx = row.as_ref().column_index(col)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected {col} value {raw:?}").into(),
        )
    })
}
