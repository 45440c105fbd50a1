use super::{
    opt_time_col, text_col, time_col, AffiliateClickRow, AffiliateCodeRow, AffiliateProgramRow,
    AffiliateRow, AttributionRow, CommissionRow, Store,
};
use crate::{
    error::NexoResult,
    types::{to_millis, AffiliateStatus, CommissionStatus, OrgId, RowId, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const PROGRAM_COLUMNS: &str = "id, org_id, enabled, attribution_window_days, attribution_model, \
     subscription_first_cycles, subscription_first_rate, subscription_recurring_rate, \
     one_time_rate, created_at, updated_at";
const AFFILIATE_COLUMNS: &str =
    "id, org_id, user_id, name, email, status, created_at, updated_at";
const CODE_COLUMNS: &str = "id, org_id, affiliate_id, code, status, created_at";
const ATTRIBUTION_COLUMNS: &str = "id, org_id, user_id, affiliate_id, affiliate_code_id, \
     affiliate_click_id, attributed_at, expires_at, locked, locked_at, provider_subscription_id";
const COMMISSION_COLUMNS: &str = "id, org_id, affiliate_id, user_id, payment_user_id, product_id, \
     currency, amount_cents, rate_applied, cycle_number, status, provider_event_id, \
     provider_subscription_id, created_at, paid_at, reversed_at";

fn map_program(row: &Row<'_>) -> rusqlite::Result<AffiliateProgramRow> {
    Ok(AffiliateProgramRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        enabled: row.get::<_, i32>(2)? != 0,
        attribution_window_days: row.get(3)?,
        attribution_model: text_col(row, 4)?,
        subscription_first_cycles: row.get(5)?,
        subscription_first_rate: row.get(6)?,
        subscription_recurring_rate: row.get(7)?,
        one_time_rate: row.get(8)?,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
    })
}

fn map_affiliate(row: &Row<'_>) -> rusqlite::Result<AffiliateRow> {
    Ok(AffiliateRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        email: row.get(4)?,
        status: text_col(row, 5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

fn map_code(row: &Row<'_>) -> rusqlite::Result<AffiliateCodeRow> {
    Ok(AffiliateCodeRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        affiliate_id: row.get(2)?,
        code: row.get(3)?,
        status: text_col(row, 4)?,
        created_at: time_col(row, 5)?,
    })
}

fn map_attribution(row: &Row<'_>) -> rusqlite::Result<AttributionRow> {
    Ok(AttributionRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        affiliate_id: row.get(3)?,
        affiliate_code_id: row.get(4)?,
        affiliate_click_id: row.get(5)?,
        attributed_at: time_col(row, 6)?,
        expires_at: opt_time_col(row, 7)?,
        locked: row.get::<_, i32>(8)? != 0,
        locked_at: opt_time_col(row, 9)?,
        provider_subscription_id: row.get(10)?,
    })
}

fn map_commission(row: &Row<'_>) -> rusqlite::Result<CommissionRow> {
    Ok(CommissionRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        affiliate_id: row.get(2)?,
        user_id: row.get(3)?,
        payment_user_id: row.get(4)?,
        product_id: row.get(5)?,
        currency: row.get(6)?,
        amount_cents: row.get(7)?,
        rate_applied: row.get(8)?,
        cycle_number: row.get(9)?,
        status: text_col(row, 10)?,
        provider_event_id: row.get(11)?,
        provider_subscription_id: row.get(12)?,
        created_at: time_col(row, 13)?,
        paid_at: opt_time_col(row, 14)?,
        reversed_at: opt_time_col(row, 15)?,
    })
}

/// Attribution fields written on insert and on re-attribution.
#[derive(Debug, Clone, Copy)]
pub struct AttributionTarget {
    pub affiliate_id: RowId,
    pub affiliate_code_id: RowId,
    pub affiliate_click_id: Option<RowId>,
    pub attributed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A commission about to be written to the ledger.
#[derive(Debug, Clone)]
pub struct NewCommission {
    pub org_id: OrgId,
    pub affiliate_id: RowId,
    pub user_id: UserId,
    pub payment_user_id: RowId,
    pub product_id: RowId,
    pub currency: String,
    pub amount_cents: i64,
    pub rate_applied: f64,
    pub cycle_number: i64,
    pub provider_event_id: String,
    pub provider_subscription_id: Option<String>,
}

/// Per-affiliate aggregates for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffiliateTotals {
    pub clicks: i64,
    pub signups: i64,
    pub pending_cents: i64,
    pub paid_cents: i64,
    pub first_pending_currency: Option<String>,
    pub first_paid_currency: Option<String>,
}

impl Store {
    // ── Affiliate program ──────────────────────────────────────

    pub fn affiliate_program(&self, org_id: OrgId) -> NexoResult<Option<AffiliateProgramRow>> {
        let sql = format!("SELECT {PROGRAM_COLUMNS} FROM affiliate_program WHERE org_id = ?1");
        Ok(self.conn.query_row(&sql, params![org_id], map_program).optional()?)
    }

    /// Insert the column defaults unless the org already has a program.
    pub fn ensure_affiliate_program(&self, org_id: OrgId, now: DateTime<Utc>) -> NexoResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO affiliate_program (org_id, created_at, updated_at)
             VALUES (?1, ?2, ?2)",
            params![org_id, to_millis(now)],
        )?;
        Ok(())
    }

    pub fn update_affiliate_program(&self, program: &AffiliateProgramRow, now: DateTime<Utc>) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate_program SET
                enabled = ?1,
                attribution_window_days = ?2,
                attribution_model = ?3,
                subscription_first_cycles = ?4,
                subscription_first_rate = ?5,
                subscription_recurring_rate = ?6,
                one_time_rate = ?7,
                updated_at = ?8
             WHERE org_id = ?9",
            params![
                program.enabled,
                program.attribution_window_days,
                program.attribution_model.as_str(),
                program.subscription_first_cycles,
                program.subscription_first_rate,
                program.subscription_recurring_rate,
                program.one_time_rate,
                to_millis(now),
                program.org_id,
            ],
        )?;
        Ok(())
    }

    // ── Affiliate ──────────────────────────────────────────────

    pub fn insert_affiliate(
        &self,
        org_id: OrgId,
        user_id: Option<UserId>,
        name: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO affiliate (org_id, user_id, name, email, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![org_id, user_id, name, email, AffiliateStatus::Active.as_str(), to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn affiliate(&self, affiliate_id: RowId) -> NexoResult<Option<AffiliateRow>> {
        let sql = format!("SELECT {AFFILIATE_COLUMNS} FROM affiliate WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![affiliate_id], map_affiliate).optional()?)
    }

    pub fn affiliates_for_org(&self, org_id: OrgId) -> NexoResult<Vec<AffiliateRow>> {
        let sql = format!("SELECT {AFFILIATE_COLUMNS} FROM affiliate WHERE org_id = ?1 ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id], map_affiliate)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn set_affiliate_status(
        &self,
        affiliate_id: RowId,
        status: AffiliateStatus,
        now: DateTime<Utc>,
    ) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_millis(now), affiliate_id],
        )?;
        Ok(())
    }

    // ── Affiliate code ─────────────────────────────────────────

    /// Codes are unique across all organizations.
    pub fn affiliate_code_taken(&self, code: &str) -> NexoResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM affiliate_code WHERE code = ?1",
            params![code],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn insert_affiliate_code(
        &self,
        org_id: OrgId,
        affiliate_id: RowId,
        code: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO affiliate_code (org_id, affiliate_id, code, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![org_id, affiliate_id, code, AffiliateStatus::Active.as_str(), to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn affiliate_code(&self, code_id: RowId) -> NexoResult<Option<AffiliateCodeRow>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM affiliate_code WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![code_id], map_code).optional()?)
    }

    pub fn affiliate_code_in_org(&self, org_id: OrgId, code: &str) -> NexoResult<Option<AffiliateCodeRow>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM affiliate_code WHERE org_id = ?1 AND code = ?2");
        Ok(self.conn.query_row(&sql, params![org_id, code], map_code).optional()?)
    }

    pub fn codes_for_affiliate(&self, affiliate_id: RowId) -> NexoResult<Vec<AffiliateCodeRow>> {
        let sql = format!("SELECT {CODE_COLUMNS} FROM affiliate_code WHERE affiliate_id = ?1 ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![affiliate_id], map_code)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn set_affiliate_code_status(&self, code_id: RowId, status: AffiliateStatus) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate_code SET status = ?1 WHERE id = ?2",
            params![status.as_str(), code_id],
        )?;
        Ok(())
    }

    // ── Click ──────────────────────────────────────────────────

    pub fn insert_affiliate_click(
        &self,
        org_id: OrgId,
        code_id: RowId,
        landing_url: &str,
        user_agent: &str,
        ip_hash: &str,
        now: DateTime<Utc>,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO affiliate_click (org_id, affiliate_code_id, landing_url, user_agent, ip_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![org_id, code_id, landing_url, user_agent, ip_hash, to_millis(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn affiliate_click(&self, click_id: RowId) -> NexoResult<Option<AffiliateClickRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, org_id, affiliate_code_id, landing_url, user_agent, ip_hash, created_at
                 FROM affiliate_click WHERE id = ?1",
                params![click_id],
                |r| {
                    Ok(AffiliateClickRow {
                        id: r.get(0)?,
                        org_id: r.get(1)?,
                        affiliate_code_id: r.get(2)?,
                        landing_url: r.get(3)?,
                        user_agent: r.get(4)?,
                        ip_hash: r.get(5)?,
                        created_at: time_col(r, 6)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Attribution ────────────────────────────────────────────

    pub fn attribution(&self, org_id: OrgId, user_id: UserId) -> NexoResult<Option<AttributionRow>> {
        let sql = format!(
            "SELECT {ATTRIBUTION_COLUMNS} FROM affiliate_attribution WHERE org_id = ?1 AND user_id = ?2"
        );
        Ok(self
            .conn
            .query_row(&sql, params![org_id, user_id], map_attribution)
            .optional()?)
    }

    pub fn insert_attribution(
        &self,
        org_id: OrgId,
        user_id: UserId,
        target: &AttributionTarget,
    ) -> NexoResult<RowId> {
        self.conn.execute(
            "INSERT INTO affiliate_attribution (
                org_id, user_id, affiliate_id, affiliate_code_id, affiliate_click_id,
                attributed_at, expires_at, locked
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                org_id,
                user_id,
                target.affiliate_id,
                target.affiliate_code_id,
                target.affiliate_click_id,
                to_millis(target.attributed_at),
                to_millis(target.expires_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Re-point an unlocked attribution. Locked rows are left untouched.
    pub fn overwrite_attribution(&self, attribution_id: RowId, target: &AttributionTarget) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate_attribution SET
                affiliate_id = ?1,
                affiliate_code_id = ?2,
                affiliate_click_id = ?3,
                attributed_at = ?4,
                expires_at = ?5
             WHERE id = ?6 AND locked = 0",
            params![
                target.affiliate_id,
                target.affiliate_code_id,
                target.affiliate_click_id,
                to_millis(target.attributed_at),
                to_millis(target.expires_at),
                attribution_id,
            ],
        )?;
        Ok(())
    }

    // ── Commission ─────────────────────────────────────────────

    pub fn commission_for_event(
        &self,
        org_id: OrgId,
        payment_user_id: RowId,
        provider_event_id: &str,
    ) -> NexoResult<Option<CommissionRow>> {
        let sql = format!(
            "SELECT {COMMISSION_COLUMNS} FROM affiliate_commission
             WHERE org_id = ?1 AND payment_user_id = ?2 AND provider_event_id = ?3"
        );
        Ok(self
            .conn
            .query_row(&sql, params![org_id, payment_user_id, provider_event_id], map_commission)
            .optional()?)
    }

    /// Non-reversed commissions already booked for one subscription.
    pub fn commission_cycles(
        &self,
        org_id: OrgId,
        affiliate_id: RowId,
        provider_subscription_id: &str,
    ) -> NexoResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM affiliate_commission
             WHERE org_id = ?1 AND affiliate_id = ?2 AND provider_subscription_id = ?3
               AND status != 'reversed'",
            params![org_id, affiliate_id, provider_subscription_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Insert the ledger row and lock the attribution in one transaction.
    ///
    /// The lock only fills `locked_at` and the subscription id when the row
    /// was not locked yet. Returns the new commission id and whether this
    /// call performed the lock.
    pub fn record_commission_and_lock(
        &self,
        commission: &NewCommission,
        attribution_id: RowId,
        now: DateTime<Utc>,
    ) -> NexoResult<(RowId, bool)> {
        self.atomic(|store| {
            store.conn.execute(
                "INSERT INTO affiliate_commission (
                    org_id, affiliate_id, user_id, payment_user_id, product_id, currency,
                    amount_cents, rate_applied, cycle_number, status, provider_event_id,
                    provider_subscription_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    commission.org_id,
                    commission.affiliate_id,
                    commission.user_id,
                    commission.payment_user_id,
                    commission.product_id,
                    commission.currency,
                    commission.amount_cents,
                    commission.rate_applied,
                    commission.cycle_number,
                    CommissionStatus::Pending.as_str(),
                    commission.provider_event_id,
                    commission.provider_subscription_id,
                    to_millis(now),
                ],
            )?;
            let commission_id = store.conn.last_insert_rowid();
            let locked = store.conn.execute(
                "UPDATE affiliate_attribution SET
                    locked = 1,
                    locked_at = ?1,
                    provider_subscription_id = COALESCE(provider_subscription_id, ?2)
                 WHERE id = ?3 AND locked = 0",
                params![to_millis(now), commission.provider_subscription_id, attribution_id],
            )?;
            Ok((commission_id, locked > 0))
        })
    }

    pub fn commission(&self, commission_id: RowId) -> NexoResult<Option<CommissionRow>> {
        let sql = format!("SELECT {COMMISSION_COLUMNS} FROM affiliate_commission WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![commission_id], map_commission).optional()?)
    }

    pub fn commissions_for_org(
        &self,
        org_id: OrgId,
        affiliate_id: Option<RowId>,
    ) -> NexoResult<Vec<CommissionRow>> {
        let sql = format!(
            "SELECT {COMMISSION_COLUMNS} FROM affiliate_commission
             WHERE org_id = ?1 AND (?2 IS NULL OR affiliate_id = ?2)
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id, affiliate_id], map_commission)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn commissions_for_provider_event(
        &self,
        org_id: OrgId,
        provider_event_id: &str,
    ) -> NexoResult<Vec<CommissionRow>> {
        let sql = format!(
            "SELECT {COMMISSION_COLUMNS} FROM affiliate_commission
             WHERE org_id = ?1 AND provider_event_id = ?2 ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id, provider_event_id], map_commission)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn mark_commission_paid(&self, commission_id: RowId, now: DateTime<Utc>) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate_commission SET status = 'paid', paid_at = ?1 WHERE id = ?2",
            params![to_millis(now), commission_id],
        )?;
        Ok(())
    }

    pub fn mark_commission_reversed(&self, commission_id: RowId, now: DateTime<Utc>) -> NexoResult<()> {
        self.conn.execute(
            "UPDATE affiliate_commission SET status = 'reversed', reversed_at = ?1 WHERE id = ?2",
            params![to_millis(now), commission_id],
        )?;
        Ok(())
    }

    // ── Stats ──────────────────────────────────────────────────

    pub fn affiliate_totals(&self, affiliate_id: RowId) -> NexoResult<AffiliateTotals> {
        let clicks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM affiliate_click c
             JOIN affiliate_code ac ON ac.id = c.affiliate_code_id
             WHERE ac.affiliate_id = ?1",
            params![affiliate_id],
            |r| r.get(0),
        )?;
        let signups: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM affiliate_attribution WHERE affiliate_id = ?1",
            params![affiliate_id],
            |r| r.get(0),
        )?;
        let sum_for = |status: CommissionStatus| -> NexoResult<i64> {
            let total: i64 = self.conn.query_row(
                "SELECT COALESCE(SUM(amount_cents), 0) FROM affiliate_commission
                 WHERE affiliate_id = ?1 AND status = ?2",
                params![affiliate_id, status.as_str()],
                |r| r.get(0),
            )?;
            Ok(total)
        };
        let first_currency = |status: CommissionStatus| -> NexoResult<Option<String>> {
            Ok(self
                .conn
                .query_row(
                    "SELECT currency FROM affiliate_commission
                     WHERE affiliate_id = ?1 AND status = ?2
                     ORDER BY id ASC LIMIT 1",
                    params![affiliate_id, status.as_str()],
                    |r| r.get(0),
                )
                .optional()?)
        };
        Ok(AffiliateTotals {
            clicks,
            signups,
            pending_cents: sum_for(CommissionStatus::Pending)?,
            paid_cents: sum_for(CommissionStatus::Paid)?,
            first_pending_currency: first_currency(CommissionStatus::Pending)?,
            first_paid_currency: first_currency(CommissionStatus::Paid)?,
        })
    }
}
