//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Services call store methods; they never execute SQL directly.

mod affiliates;
mod audit;
mod courses;
mod invites;
mod orgs;
mod password_reset;
mod payments;
mod roles;
mod usage;
mod users;

use crate::{
    error::NexoResult,
    event::{DomainEvent, EventLogEntry},
    rbac::Rights,
    types::{
        to_millis, AffiliateStatus, AttributionModel, AuthorStatus, Authorship,
        CommissionStatus, OrgId, PaymentStatus, ProductType, RoleType, RowId, UserId,
    },
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

pub use affiliates::{AffiliateTotals, AttributionTarget, NewCommission};
pub use audit::AuditFilter;
pub use payments::ProductFields;
pub use users::NewUserRow;

/// `:memory:` and `file::memory:` style URIs never touch disk.
pub fn is_memory_path(path: &str) -> bool {
    let path = path.trim();
    path.is_empty() || path == ":memory:" || path.contains("mode=memory") || path.starts_with("file::memory:")
}

pub struct Store {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl Store {
    pub fn open(path: &str) -> NexoResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> NexoResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database file.
    ///
    /// An in-memory store has no file to share: reopening it yields a fresh,
    /// empty and unmigrated database. Check `is_in_memory` before handing the
    /// result to anything that expects to see this store's rows.
    pub fn reopen(&self) -> NexoResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_deref().map_or(true, is_memory_path)
    }

    /// Run `f` inside a savepoint: everything it writes commits together or
    /// not at all. Calls nest; an inner block only commits into the outer one.
    pub fn atomic<T>(&self, f: impl FnOnce(&Store) -> NexoResult<T>) -> NexoResult<T> {
        self.conn.execute_batch("SAVEPOINT nexo_atomic")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE nexo_atomic")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO nexo_atomic; RELEASE nexo_atomic")
                {
                    log::error!("savepoint rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> NexoResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_courses.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_org_config.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_payments.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_affiliates.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/006_audit_log.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/007_password_reset.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/008_invite_codes.sql"))?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, event: &DomainEvent, at: DateTime<Utc>) -> NexoResult<()> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO event_log (org_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.org_id(), event.event_type(), payload, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn events_for_org(&self, org_id: OrgId) -> NexoResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, event_type, payload, created_at
             FROM event_log WHERE org_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![org_id], map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Whether a `payment_recorded` entry for this provider event exists.
    pub fn payment_event_recorded(&self, org_id: OrgId, provider_event_id: &str) -> NexoResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM event_log
                 WHERE event_type = 'payment_recorded' AND org_id = ?1
                   AND json_extract(payload, '$.provider_event_id') = ?2
                 LIMIT 1",
                params![org_id, provider_event_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn events_of_type(&self, event_type: &str) -> NexoResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, event_type, payload, created_at
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        id: Some(row.get(0)?),
        org_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ── Column helpers ─────────────────────────────────────────────

/// Read a TEXT column into one of the `text_enum!` types.
fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Read a TEXT column holding JSON.
fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(crate::types::from_millis(row.get(idx)?))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(crate::types::opt_from_millis(row.get(idx)?))
}

// ── Row types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationRow {
    pub id: OrgId,
    pub org_uuid: String,
    pub name: String,
    pub slug: String,
    pub email: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub user_uuid: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRow {
    pub id: RowId,
    pub role_uuid: String,
    pub name: String,
    pub description: String,
    pub role_type: RoleType,
    pub org_id: Option<OrgId>,
    pub rights: Rights,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub user_id: UserId,
    pub org_id: OrgId,
    pub role_id: RowId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRow {
    pub id: RowId,
    pub course_uuid: String,
    pub org_id: OrgId,
    pub name: String,
    pub description: String,
    pub public: bool,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRow {
    pub id: RowId,
    pub chapter_uuid: String,
    pub course_id: RowId,
    pub name: String,
    pub description: String,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: RowId,
    pub activity_uuid: String,
    pub chapter_id: RowId,
    pub name: String,
    pub activity_type: String,
    pub content: Value,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRow {
    pub resource_uuid: String,
    pub user_id: UserId,
    pub authorship: Authorship,
    pub status: AuthorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub name: String,
    pub description: String,
    pub product_type: ProductType,
    pub amount: f64,
    pub currency: String,
    pub provider_product_id: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentUserRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub payment_product_id: RowId,
    pub status: PaymentStatus,
    pub provider_specific_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateProgramRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub enabled: bool,
    pub attribution_window_days: i64,
    pub attribution_model: AttributionModel,
    pub subscription_first_cycles: i64,
    pub subscription_first_rate: f64,
    pub subscription_recurring_rate: f64,
    pub one_time_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: String,
    pub status: AffiliateStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateCodeRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub affiliate_id: RowId,
    pub code: String,
    pub status: AffiliateStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateClickRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub affiliate_code_id: RowId,
    pub landing_url: String,
    pub user_agent: String,
    pub ip_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub affiliate_id: RowId,
    pub affiliate_code_id: Option<RowId>,
    pub affiliate_click_id: Option<RowId>,
    pub attributed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub provider_subscription_id: Option<String>,
}

impl AttributionRow {
    /// Locked rows never expire; unlocked rows are active until `expires_at`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.locked || self.expires_at.map_or(true, |expires| expires >= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRow {
    pub id: RowId,
    pub org_id: OrgId,
    pub affiliate_id: RowId,
    pub user_id: UserId,
    pub payment_user_id: Option<RowId>,
    pub product_id: Option<RowId>,
    pub currency: String,
    pub amount_cents: i64,
    pub rate_applied: f64,
    pub cycle_number: i64,
    pub status: CommissionStatus,
    pub provider_event_id: String,
    pub provider_subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub reversed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRow {
    pub id: RowId,
    pub user_id: Option<UserId>,
    /// Joined from `user` when the row still resolves.
    pub username: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub payload: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteCodeRow {
    pub id: RowId,
    pub invite_code_uuid: String,
    pub org_id: OrgId,
    pub code: String,
    pub created_by: Option<UserId>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl InviteCodeRow {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetRow {
    pub id: RowId,
    pub user_id: UserId,
    pub org_id: OrgId,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
