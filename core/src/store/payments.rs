use super::{json_col, text_col, time_col, PaymentUserRow, ProductRow, Store};
use crate::{
    error::NexoResult,
    types::{to_millis, OrgId, PaymentStatus, ProductType, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

const PRODUCT_COLUMNS: &str = "id, org_id, name, description, product_type, amount, currency, \
     provider_product_id, archived, created_at, updated_at";
const PAYMENT_USER_COLUMNS: &str = "id, org_id, user_id, payment_product_id, status, \
     provider_specific_data, created_at, updated_at";

fn map_product(row: &Row<'_>) -> rusqlite::Result<ProductRow> {
    Ok(ProductRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        product_type: text_col(row, 4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        provider_product_id: row.get(7)?,
        archived: row.get::<_, i32>(8)? != 0,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
    })
}

fn map_payment_user(row: &Row<'_>) -> rusqlite::Result<PaymentUserRow> {
    Ok(PaymentUserRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        payment_product_id: row.get(3)?,
        status: text_col(row, 4)?,
        provider_specific_data: json_col(row, 5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

/// Fields of a product insert or update.
#[derive(Debug, Clone)]
pub struct ProductFields<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub product_type: ProductType,
    pub amount: f64,
    pub currency: &'a str,
    pub provider_product_id: &'a str,
}

impl Store {
    // ── Product ────────────────────────────────────────────────

    pub fn insert_product(
        &self,
        org_id: OrgId,
        fields: &ProductFields<'_>,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO payments_product (
                org_id, name, description, product_type, amount, currency,
                provider_product_id, archived, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
            params![
                org_id,
                fields.name,
                fields.description,
                fields.product_type.as_str(),
                fields.amount,
                fields.currency,
                fields.provider_product_id,
                to_millis(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_product(
        &self,
        product_id: RowId,
        fields: &ProductFields<'_>,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE payments_product SET
                name = ?1, description = ?2, product_type = ?3, amount = ?4,
                currency = ?5, provider_product_id = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                fields.name,
                fields.description,
                fields.product_type.as_str(),
                fields.amount,
                fields.currency,
                fields.provider_product_id,
                to_millis(now),
                product_id,
            ],
        )?;
        Ok(())
    }

    pub fn set_product_archived(
        &self,
        product_id: RowId,
        archived: bool,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE payments_product SET archived = ?1, updated_at = ?2 WHERE id = ?3",
            params![archived, to_millis(now), product_id],
        )?;
        Ok(())
    }

    pub fn product(&self, product_id: RowId) -> NexoResult<Option<ProductRow>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM payments_product WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![product_id], map_product).optional()?)
    }

    pub fn products_for_org(&self, org_id: OrgId, include_archived: bool) -> NexoResult<Vec<ProductRow>> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM payments_product
             WHERE org_id = ?1 AND (?2 OR archived = 0)
             ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id, include_archived], map_product)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Course linkage ─────────────────────────────────────────

    pub fn link_product_course(&self, org_id: OrgId, product_id: RowId, course_id: RowId) -> NexoResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO payments_course (product_id, course_id, org_id) VALUES (?1, ?2, ?3)",
            params![product_id, course_id, org_id],
        )?;
        Ok(())
    }

    pub fn unlink_product_course(&self, product_id: RowId, course_id: RowId) -> NexoResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM payments_course WHERE product_id = ?1 AND course_id = ?2",
            params![product_id, course_id],
        )?;
        Ok(removed > 0)
    }

    pub fn product_ids_for_course(&self, course_id: RowId) -> NexoResult<Vec<RowId>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id FROM payments_course WHERE course_id = ?1 ORDER BY product_id ASC",
        )?;
        let rows = stmt.query_map(params![course_id], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn course_ids_for_product(&self, product_id: RowId) -> NexoResult<Vec<RowId>> {
        let mut stmt = self.conn.prepare(
            "SELECT course_id FROM payments_course WHERE product_id = ?1 ORDER BY course_id ASC",
        )?;
        let rows = stmt.query_map(params![product_id], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Payment user ───────────────────────────────────────────

    /// One row per (org, user, product); later events update status and data.
    pub fn upsert_payment_user(
        &self,
        org_id: OrgId,
        user_id: UserId,
        product_id: RowId,
        status: PaymentStatus,
        provider_data: &Value,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        let id: RowId = self.conn.query_row(
            "INSERT INTO payments_user (
                org_id, user_id, payment_product_id, status, provider_specific_data, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(org_id, user_id, payment_product_id) DO UPDATE SET
                status = excluded.status,
                provider_specific_data = excluded.provider_specific_data,
                updated_at = excluded.updated_at
            RETURNING id",
            params![
                org_id,
                user_id,
                product_id,
                status.as_str(),
                provider_data.to_string(),
                to_millis(now),
            ],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn payment_user(&self, payment_user_id: RowId) -> NexoResult<Option<PaymentUserRow>> {
        let sql = format!("SELECT {PAYMENT_USER_COLUMNS} FROM payments_user WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![payment_user_id], map_payment_user)
            .optional()?)
    }

    pub fn payment_user_for(
        &self,
        org_id: OrgId,
        user_id: UserId,
        product_id: RowId,
    ) -> NexoResult<Option<PaymentUserRow>> {
        let sql = format!(
            "SELECT {PAYMENT_USER_COLUMNS} FROM payments_user
             WHERE org_id = ?1 AND user_id = ?2 AND payment_product_id = ?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![org_id, user_id, product_id], map_payment_user)
            .optional()?)
    }

    pub fn payment_users_for_user(&self, org_id: OrgId, user_id: UserId) -> NexoResult<Vec<PaymentUserRow>> {
        let sql = format!(
            "SELECT {PAYMENT_USER_COLUMNS} FROM payments_user
             WHERE org_id = ?1 AND user_id = ?2 ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id, user_id], map_payment_user)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn payment_users_for_org(&self, org_id: OrgId) -> NexoResult<Vec<PaymentUserRow>> {
        let sql = format!(
            "SELECT {PAYMENT_USER_COLUMNS} FROM payments_user WHERE org_id = ?1 ORDER BY id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id], map_payment_user)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn set_payment_user_status(
        &self,
        payment_user_id: RowId,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE payments_user SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_millis(now), payment_user_id],
        )?;
        Ok(())
    }
}
