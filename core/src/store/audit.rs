use super::{time_col, AuditLogRow, Store};
use crate::{
    audit_service::AuditEntry,
    error::NexoResult,
    types::{to_millis, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Row};

/// Audit log filters. Text filters are case-insensitive substring matches.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub username: Option<String>,
    /// Matches "first_name last_name".
    pub name: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub status_code: Option<i64>,
    pub ip_address: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// WHERE clause (possibly empty) and its positional arguments.
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        let mut like = |clause: &'static str, value: &Option<String>| {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                clauses.push(clause);
                args.push(SqlValue::Text(format!("%{v}%")));
            }
        };
        like("CAST(a.user_id AS TEXT) LIKE ?", &self.user_id);
        like("u.username LIKE ?", &self.username);
        like("(u.first_name || ' ' || u.last_name) LIKE ?", &self.name);
        like("a.action LIKE ?", &self.action);
        like("a.resource LIKE ?", &self.resource);
        like("a.ip_address LIKE ?", &self.ip_address);
        if let Some(code) = self.status_code {
            clauses.push("a.status_code = ?");
            args.push(SqlValue::Integer(code));
        }
        if let Some(start) = self.start {
            clauses.push("a.created_at >= ?");
            args.push(SqlValue::Integer(to_millis(start)));
        }
        if let Some(end) = self.end {
            clauses.push("a.created_at <= ?");
            args.push(SqlValue::Integer(to_millis(end)));
        }
        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), args)
        }
    }
}

fn map_audit(row: &Row<'_>) -> rusqlite::Result<AuditLogRow> {
    Ok(AuditLogRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        action: row.get(3)?,
        resource: row.get(4)?,
        resource_id: row.get(5)?,
        method: row.get(6)?,
        path: row.get(7)?,
        status_code: row.get(8)?,
        payload: row.get(9)?,
        ip_address: row.get(10)?,
        created_at: time_col(row, 11)?,
    })
}

impl Store {
    // ── Audit log ──────────────────────────────────────────────

    /// All-or-nothing batch insert.
    pub fn insert_audit_batch(&self, entries: &[AuditEntry]) -> NexoResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO audit_log (
                    user_id, action, resource, resource_id, method, path,
                    status_code, payload, ip_address, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for entry in entries {
                let payload = entry.payload.as_ref().map(|p| p.to_string());
                stmt.execute(params![
                    entry.user_id,
                    entry.action,
                    entry.resource,
                    entry.resource_id,
                    entry.method,
                    entry.path,
                    entry.status_code,
                    payload,
                    entry.ip_address,
                    to_millis(entry.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    pub fn count_audit_logs(&self, filter: &AuditFilter) -> NexoResult<i64> {
        let (clause, args) = filter.to_sql();
        let sql = format!(
            "SELECT COUNT(*) FROM audit_log a LEFT JOIN user u ON u.id = a.user_id {clause}"
        );
        let n: i64 = self
            .conn
            .query_row(&sql, params_from_iter(args.iter()), |r| r.get(0))?;
        Ok(n)
    }

    /// Newest first. `limit = None` returns every match.
    pub fn audit_logs(
        &self,
        filter: &AuditFilter,
        offset: i64,
        limit: Option<i64>,
    ) -> NexoResult<Vec<AuditLogRow>> {
        let (clause, mut args) = filter.to_sql();
        args.push(SqlValue::Integer(limit.unwrap_or(-1)));
        args.push(SqlValue::Integer(offset.max(0)));
        let sql = format!(
            "SELECT a.id, a.user_id, u.username, a.action, a.resource, a.resource_id,
                    a.method, a.path, a.status_code, a.payload, a.ip_address, a.created_at
             FROM audit_log a LEFT JOIN user u ON u.id = a.user_id
             {clause}
             ORDER BY a.created_at DESC, a.id DESC
             LIMIT ? OFFSET ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), map_audit)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn audit_log_count_for_user(&self, user_id: UserId) -> NexoResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}
