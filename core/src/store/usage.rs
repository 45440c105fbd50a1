use super::Store;
use crate::{error::NexoResult, types::OrgId};
use rusqlite::{params, OptionalExtension};

impl Store {
    // ── Feature usage ──────────────────────────────────────────

    pub fn feature_usage(&self, org_id: OrgId, feature: &str) -> NexoResult<i64> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT count FROM feature_usage WHERE org_id = ?1 AND feature = ?2",
                params![org_id, feature],
                |r| r.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    pub fn increment_feature_usage(&self, org_id: OrgId, feature: &str) -> NexoResult<i64> {
        let count: i64 = self.conn.query_row(
            "INSERT INTO feature_usage (org_id, feature, count) VALUES (?1, ?2, 1)
             ON CONFLICT(org_id, feature) DO UPDATE SET count = count + 1
             RETURNING count",
            params![org_id, feature],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Never goes below zero.
    pub fn decrement_feature_usage(&self, org_id: OrgId, feature: &str) -> NexoResult<i64> {
        self.conn.execute(
            "UPDATE feature_usage SET count = MAX(count - 1, 0)
             WHERE org_id = ?1 AND feature = ?2",
            params![org_id, feature],
        )?;
        self.feature_usage(org_id, feature)
    }
}
