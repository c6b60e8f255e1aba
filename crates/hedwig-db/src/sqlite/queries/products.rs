use chrono::Utc;
use rusqlite::{params, Row};

use hedwig_core::product::{AttachmentProduct, CreateProduct, ProductRole};

use super::super::{SqliteDatabase, SqliteResultExt};
use super::parse_text_col;
use crate::DbError;

fn row_to_product(row: &Row) -> rusqlite::Result<AttachmentProduct> {
    Ok(AttachmentProduct {
        id: row.get("id")?,
        attachment_id: row.get("attachment_id")?,
        role: parse_text_col(row, "role", ProductRole::parse_str)?,
        page: row.get("page")?,
        store_key: row.get("store_key")?,
        created_at: row.get("created_at")?,
    })
}

const LIST_SQL: &str = "SELECT * FROM attachment_products
                        WHERE attachment_id = ?1
                        ORDER BY role, page, id";

impl SqliteDatabase {
    /// Swap the product set of an attachment inside one transaction.
    pub fn replace_products_sync(
        &self,
        attachment_id: i64,
        products: &[CreateProduct],
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().to_db()?;

            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM attachments WHERE id = ?1)",
                    params![attachment_id],
                    |row| row.get(0),
                )
                .to_db()?;
            if !exists {
                return Err(DbError::NotFound(format!("attachment {attachment_id}")));
            }

            tx.execute(
                "DELETE FROM attachment_products WHERE attachment_id = ?1",
                params![attachment_id],
            )
            .to_db()?;

            let now = Utc::now();
            for product in products {
                tx.execute(
                    "INSERT INTO attachment_products (attachment_id, role, page, store_key, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        attachment_id,
                        product.role.as_str(),
                        product.page,
                        product.store_key,
                        now
                    ],
                )
                .to_db()?;
            }

            let stored = tx
                .prepare(LIST_SQL)
                .to_db()?
                .query_map(params![attachment_id], row_to_product)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;

            tx.commit().to_db()?;
            Ok(stored)
        })
    }

    pub fn list_products_sync(&self, attachment_id: i64) -> Result<Vec<AttachmentProduct>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(LIST_SQL).to_db()?;
            let products = stmt
                .query_map(params![attachment_id], row_to_product)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(products)
        })
    }
}
