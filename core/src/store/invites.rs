use super::{time_col, InviteCodeRow, Store};
use crate::{
    error::NexoResult,
    types::{to_millis, OrgId, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const INVITE_COLUMNS: &str =
    "id, invite_code_uuid, org_id, code, created_by, expires_at, created_at";

fn map_invite(row: &Row<'_>) -> rusqlite::Result<InviteCodeRow> {
    Ok(InviteCodeRow {
        id: row.get(0)?,
        invite_code_uuid: row.get(1)?,
        org_id: row.get(2)?,
        code: row.get(3)?,
        created_by: row.get(4)?,
        expires_at: time_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

impl Store {
    // ── Invite codes ───────────────────────────────────────────

    pub fn insert_invite_code(
        &self,
        org_id: OrgId,
        invite_code_uuid: &str,
        code: &str,
        created_by: Option<UserId>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO org_invite_code (
                invite_code_uuid, org_id, code, created_by, expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                invite_code_uuid,
                org_id,
                code,
                created_by,
                to_millis(expires_at),
                to_millis(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn invite_code(&self, org_id: OrgId, code: &str) -> NexoResult<Option<InviteCodeRow>> {
        let sql = format!("SELECT {INVITE_COLUMNS} FROM org_invite_code WHERE org_id = ?1 AND code = ?2");
        Ok(self.conn.query_row(&sql, params![org_id, code], map_invite).optional()?)
    }

    pub fn invite_code_by_id(&self, invite_id: RowId) -> NexoResult<Option<InviteCodeRow>> {
        let sql = format!("SELECT {INVITE_COLUMNS} FROM org_invite_code WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![invite_id], map_invite).optional()?)
    }

    pub fn invite_codes_for_org(&self, org_id: OrgId) -> NexoResult<Vec<InviteCodeRow>> {
        let sql = format!(
            "SELECT {INVITE_COLUMNS} FROM org_invite_code WHERE org_id = ?1 ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id], map_invite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_invite_code(&self, org_id: OrgId, invite_code_uuid: &str) -> NexoResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM org_invite_code WHERE org_id = ?1 AND invite_code_uuid = ?2",
            params![org_id, invite_code_uuid],
        )?;
        Ok(removed > 0)
    }
}
