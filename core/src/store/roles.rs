use super::{json_col, text_col, time_col, RoleRow, Store};
use crate::{
    error::NexoResult,
    rbac::{DefaultRole, Rights},
    types::{to_millis, OrgId, RoleType, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ROLE_COLUMNS: &str =
    "id, role_uuid, name, description, role_type, org_id, rights, created_at, updated_at";

fn map_role(row: &Row<'_>) -> rusqlite::Result<RoleRow> {
    Ok(RoleRow {
        id: row.get(0)?,
        role_uuid: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        role_type: text_col(row, 4)?,
        org_id: row.get(5)?,
        rights: json_col(row, 6)?,
        created_at: time_col(row, 7)?,
        updated_at: time_col(row, 8)?,
    })
}

impl Store {
    // ── Role ───────────────────────────────────────────────────

    /// Insert or refresh a global default role under its fixed id.
    pub fn upsert_global_role(&self, role: &DefaultRole, now: DateTime<Utc>) -> NexoResult<()> {
        let rights = serde_json::to_string(&role.rights)?;
        self.conn.execute(
            "INSERT INTO role (id, role_uuid, name, description, role_type, org_id, rights, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
                role_uuid = excluded.role_uuid,
                name = excluded.name,
                description = excluded.description,
                rights = excluded.rights,
                updated_at = excluded.updated_at",
            params![
                role.id,
                role.role_uuid,
                role.name,
                role.description,
                RoleType::Global.as_str(),
                rights,
                to_millis(now),
            ],
        )?;
        Ok(())
    }

    pub fn insert_org_role(
        &self,
        org_id: OrgId,
        role_uuid: &str,
        name: &str,
        description: &str,
        rights: &Rights,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        let rights = serde_json::to_string(rights)?;
        self.conn.execute(
            "INSERT INTO role (role_uuid, name, description, role_type, org_id, rights, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                role_uuid,
                name,
                description,
                RoleType::Organization.as_str(),
                org_id,
                rights,
                to_millis(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn role(&self, role_id: RowId) -> NexoResult<Option<RoleRow>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM role WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![role_id], map_role).optional()?)
    }

    pub fn role_by_uuid(&self, role_uuid: &str) -> NexoResult<Option<RoleRow>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM role WHERE role_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![role_uuid], map_role).optional()?)
    }

    pub fn global_roles(&self) -> NexoResult<Vec<RoleRow>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM role WHERE role_type = 'global' ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_role)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Global roles plus the organization's own roles.
    pub fn roles_for_org(&self, org_id: OrgId) -> NexoResult<Vec<RoleRow>> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM role
             WHERE role_type = 'global' OR org_id = ?1
             ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id], map_role)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_role(
        &self,
        role_id: RowId,
        name: &str,
        description: &str,
        rights: &Rights,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        let rights = serde_json::to_string(rights)?;
        self.conn.execute(
            "UPDATE role SET name = ?1, description = ?2, rights = ?3, updated_at = ?4
             WHERE id = ?5",
            params![name, description, rights, to_millis(now), role_id],
        )?;
        Ok(())
    }

    pub fn delete_role(&self, role_id: RowId) -> NexoResult<()> {
        self.conn.execute("DELETE FROM role WHERE id = ?1", params![role_id])?;
        Ok(())
    }

    pub fn role_in_use(&self, role_id: RowId) -> NexoResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_organization WHERE role_id = ?1",
            params![role_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Rights of every role the user holds in the organization.
    pub fn rights_in_org(&self, user_id: UserId, org_id: OrgId) -> NexoResult<Vec<Rights>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.rights FROM user_organization uo
             JOIN role r ON r.id = uo.role_id
             WHERE uo.user_id = ?1 AND uo.org_id = ?2",
        )?;
        let rows = stmt.query_map(params![user_id, org_id], |row| json_col(row, 0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
