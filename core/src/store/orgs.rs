use super::{time_col, MembershipRow, OrganizationRow, Store};
use crate::{
    error::{NexoError, NexoResult},
    org_config::{self, OrgConfig},
    types::{to_millis, OrgId, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ORG_COLUMNS: &str =
    "id, org_uuid, name, slug, email, description, created_at, updated_at";

fn map_org(row: &Row<'_>) -> rusqlite::Result<OrganizationRow> {
    Ok(OrganizationRow {
        id: row.get(0)?,
        org_uuid: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        email: row.get(4)?,
        description: row.get(5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

impl Store {
    // ── Organization ───────────────────────────────────────────

    pub fn insert_organization(
        &self,
        org_uuid: &str,
        name: &str,
        slug: &str,
        email: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<OrgId> {
        self.conn.execute(
            "INSERT INTO organization (org_uuid, name, slug, email, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![org_uuid, name, slug, email, description, to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn organization(&self, org_id: OrgId) -> NexoResult<Option<OrganizationRow>> {
        let sql = format!("SELECT {ORG_COLUMNS} FROM organization WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![org_id], map_org).optional()?)
    }

    pub fn organization_by_slug(&self, slug: &str) -> NexoResult<Option<OrganizationRow>> {
        let sql = format!("SELECT {ORG_COLUMNS} FROM organization WHERE slug = ?1");
        Ok(self.conn.query_row(&sql, params![slug], map_org).optional()?)
    }

    pub fn organization_by_uuid(&self, org_uuid: &str) -> NexoResult<Option<OrganizationRow>> {
        let sql = format!("SELECT {ORG_COLUMNS} FROM organization WHERE org_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![org_uuid], map_org).optional()?)
    }

    pub fn organization_exists(&self, org_id: OrgId) -> NexoResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM organization WHERE id = ?1",
            params![org_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn all_organizations(&self) -> NexoResult<Vec<OrganizationRow>> {
        let sql = format!("SELECT {ORG_COLUMNS} FROM organization ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_org)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Organization config ────────────────────────────────────

    pub fn insert_org_config(
        &self,
        org_id: OrgId,
        config: &OrgConfig,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        let json = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT INTO organization_config (org_id, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![org_id, json, to_millis(now)],
        )?;
        Ok(())
    }

    pub fn update_org_config(
        &self,
        org_id: OrgId,
        config: &OrgConfig,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        let json = serde_json::to_string(config)?;
        let changed = self.conn.execute(
            "UPDATE organization_config SET config = ?1, updated_at = ?2 WHERE org_id = ?3",
            params![json, to_millis(now), org_id],
        )?;
        if changed == 0 {
            return Err(NexoError::not_found("organization config"));
        }
        Ok(())
    }

    /// Read the org config, upgrading and persisting older blobs.
    pub fn org_config(&self, org_id: OrgId, now: DateTime<Utc>) -> NexoResult<Option<OrgConfig>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT config FROM organization_config WHERE org_id = ?1",
                params![org_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let migrated = org_config::migrate(serde_json::from_str(&raw)?)?;
        if migrated.upgraded {
            log::info!("persisting upgraded config for org {org_id}");
            self.update_org_config(org_id, &migrated.config, now)?;
        }
        Ok(Some(migrated.config))
    }

    /// Store a raw blob as-is (used to seed older versions).
    pub fn put_raw_org_config(
        &self,
        org_id: OrgId,
        raw: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "INSERT INTO organization_config (org_id, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(org_id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
            params![org_id, raw.to_string(), to_millis(now)],
        )?;
        Ok(())
    }

    // ── Membership ─────────────────────────────────────────────

    pub fn insert_membership(
        &self,
        user_id: UserId,
        org_id: OrgId,
        role_id: RowId,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "INSERT INTO user_organization (user_id, org_id, role_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, org_id, role_id, to_millis(now)],
        )?;
        Ok(())
    }

    pub fn membership(&self, user_id: UserId, org_id: OrgId) -> NexoResult<Option<MembershipRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT user_id, org_id, role_id FROM user_organization
                 WHERE user_id = ?1 AND org_id = ?2",
                params![user_id, org_id],
                |r| {
                    Ok(MembershipRow {
                        user_id: r.get(0)?,
                        org_id: r.get(1)?,
                        role_id: r.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn memberships_of_user(&self, user_id: UserId) -> NexoResult<Vec<MembershipRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, org_id, role_id FROM user_organization
             WHERE user_id = ?1 ORDER BY org_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |r| {
            Ok(MembershipRow {
                user_id: r.get(0)?,
                org_id: r.get(1)?,
                role_id: r.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn members_of_org(&self, org_id: OrgId) -> NexoResult<Vec<MembershipRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, org_id, role_id FROM user_organization
             WHERE org_id = ?1 ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map(params![org_id], |r| {
            Ok(MembershipRow {
                user_id: r.get(0)?,
                org_id: r.get(1)?,
                role_id: r.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_members_with_role(&self, org_id: OrgId, role_id: RowId) -> NexoResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM user_organization WHERE org_id = ?1 AND role_id = ?2",
            params![org_id, role_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn update_membership_role(
        &self,
        user_id: UserId,
        org_id: OrgId,
        role_id: RowId,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE user_organization SET role_id = ?1, updated_at = ?2
             WHERE user_id = ?3 AND org_id = ?4",
            params![role_id, to_millis(now), user_id, org_id],
        )?;
        Ok(())
    }

    pub fn delete_membership(&self, user_id: UserId, org_id: OrgId) -> NexoResult<()> {
        self.conn.execute(
            "DELETE FROM user_organization WHERE user_id = ?1 AND org_id = ?2",
            params![user_id, org_id],
        )?;
        Ok(())
    }
}
