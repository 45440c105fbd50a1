use super::{time_col, PasswordResetRow, Store};
use crate::{
    error::NexoResult,
    types::{to_millis, OrgId, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl Store {
    // ── Password reset codes ───────────────────────────────────

    pub fn insert_reset_code(
        &self,
        user_id: UserId,
        org_id: OrgId,
        code: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.atomic(|store| {
            // A new code supersedes the user's earlier ones; expired codes of
            // anyone are swept on the way.
            store.conn.execute(
                "DELETE FROM password_reset_code
                 WHERE (user_id = ?1 AND org_id = ?2) OR expires_at < ?3",
                params![user_id, org_id, to_millis(now)],
            )?;
            store.conn.execute(
                "INSERT INTO password_reset_code (user_id, org_id, code, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, org_id, code, to_millis(expires_at), to_millis(now)],
            )?;
            Ok(store.conn.last_insert_rowid())
        })
    }

    pub fn reset_code_count(&self) -> NexoResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM password_reset_code", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Most recent matching code, expired or not.
    pub fn reset_code(
        &self,
        user_id: UserId,
        org_id: OrgId,
        code: &str,
    ) -> NexoResult<Option<PasswordResetRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, user_id, org_id, code, expires_at, created_at
                 FROM password_reset_code
                 WHERE user_id = ?1 AND org_id = ?2 AND code = ?3
                 ORDER BY id DESC LIMIT 1",
                params![user_id, org_id, code],
                |r| {
                    Ok(PasswordResetRow {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        org_id: r.get(2)?,
                        code: r.get(3)?,
                        expires_at: time_col(r, 4)?,
                        created_at: time_col(r, 5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn delete_reset_code(&self, code_id: RowId) -> NexoResult<()> {
        self.conn
            .execute("DELETE FROM password_reset_code WHERE id = ?1", params![code_id])?;
        Ok(())
    }

    /// Replace the password and consume the code atomically.
    pub fn consume_reset_code(
        &self,
        code_id: RowId,
        user_id: UserId,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE user SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, to_millis(now), user_id],
        )?;
        tx.execute("DELETE FROM password_reset_code WHERE id = ?1", params![code_id])?;
        tx.commit()?;
        Ok(())
    }
}
