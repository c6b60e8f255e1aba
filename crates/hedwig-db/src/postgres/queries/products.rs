use chrono::{DateTime, Utc};

use hedwig_core::product::{AttachmentProduct, CreateProduct, ProductRole};

use super::super::{pg_err, pg_not_found, PostgresDatabase};
use super::parse_col;
use crate::DbError;

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: i64,
    attachment_id: i64,
    role: String,
    page: Option<i32>,
    store_key: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for AttachmentProduct {
    type Error = DbError;

    fn try_from(r: ProductRow) -> Result<Self, DbError> {
        Ok(AttachmentProduct {
            id: r.id,
            attachment_id: r.attachment_id,
            role: parse_col("role", &r.role, ProductRole::parse_str)?,
            page: r.page,
            store_key: r.store_key,
            created_at: r.created_at,
        })
    }
}

const LIST_SQL: &str = "SELECT * FROM attachment_products
                        WHERE attachment_id = $1
                        ORDER BY role, page, id";

impl PostgresDatabase {
    pub(crate) async fn pg_replace_products(
        &self,
        attachment_id: i64,
        products: &[CreateProduct],
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM attachments WHERE id = $1)")
                .bind(attachment_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?;
        if !exists {
            return Err(pg_not_found(&format!("attachment {attachment_id}")));
        }

        sqlx::query("DELETE FROM attachment_products WHERE attachment_id = $1")
            .bind(attachment_id)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;

        let now = Utc::now();
        for product in products {
            sqlx::query(
                "INSERT INTO attachment_products (attachment_id, role, page, store_key, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(attachment_id)
            .bind(product.role.as_str())
            .bind(product.page)
            .bind(&product.store_key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        }

        let rows = sqlx::query_as::<_, ProductRow>(LIST_SQL)
            .bind(attachment_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(pg_err)?;

        tx.commit().await.map_err(pg_err)?;
        rows.into_iter().map(AttachmentProduct::try_from).collect()
    }

    pub(crate) async fn pg_list_products(
        &self,
        attachment_id: i64,
    ) -> Result<Vec<AttachmentProduct>, DbError> {
        let rows = sqlx::query_as::<_, ProductRow>(LIST_SQL)
            .bind(attachment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;

        rows.into_iter().map(AttachmentProduct::try_from).collect()
    }
}
