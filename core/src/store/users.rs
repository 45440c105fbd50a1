use super::{time_col, Store, UserRow};
use crate::{
    error::NexoResult,
    types::{to_millis, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const USER_COLUMNS: &str = "id, user_uuid, username, email, first_name, last_name, \
     password_hash, email_verified, created_at, updated_at";

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        user_uuid: row.get(1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        password_hash: row.get(6)?,
        email_verified: row.get::<_, i32>(7)? != 0,
        created_at: time_col(row, 8)?,
        updated_at: time_col(row, 9)?,
    })
}

/// Fields needed to persist a new user. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUserRow<'a> {
    pub user_uuid: &'a str,
    pub username: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub password_hash: &'a str,
}

impl Store {
    // ── User ───────────────────────────────────────────────────

    pub fn insert_user(&self, user: &NewUserRow<'_>, now: DateTime<Utc>) -> NexoResult<UserId> {
        self.conn.execute(
            "INSERT INTO user (
                user_uuid, username, email, first_name, last_name, password_hash,
                email_verified, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                user.user_uuid,
                user.username,
                user.email,
                user.first_name,
                user.last_name,
                user.password_hash,
                to_millis(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn user(&self, user_id: UserId) -> NexoResult<Option<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![user_id], map_user).optional()?)
    }

    pub fn user_by_email(&self, email: &str) -> NexoResult<Option<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM user WHERE email = ?1");
        Ok(self.conn.query_row(&sql, params![email], map_user).optional()?)
    }

    pub fn user_by_username(&self, username: &str) -> NexoResult<Option<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM user WHERE username = ?1");
        Ok(self.conn.query_row(&sql, params![username], map_user).optional()?)
    }

    pub fn user_by_uuid(&self, user_uuid: &str) -> NexoResult<Option<UserRow>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM user WHERE user_uuid = ?1");
        Ok(self.conn.query_row(&sql, params![user_uuid], map_user).optional()?)
    }

    pub fn update_password_hash(
        &self,
        user_id: UserId,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE user SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, to_millis(now), user_id],
        )?;
        Ok(())
    }

    /// Memberships, authorships and purchases go with the row.
    pub fn delete_user(&self, user_id: UserId) -> NexoResult<bool> {
        let removed = self.conn.execute("DELETE FROM user WHERE id = ?1", params![user_id])?;
        Ok(removed > 0)
    }

    pub fn user_count(&self) -> NexoResult<i64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM user", [], |r| r.get(0))?;
        Ok(n)
    }
}
