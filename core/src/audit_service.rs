//! Audit log: request observation, the pending queue, the flush into the
//! database, and the query/export side.
//!
//! Observed requests are serialized to JSON and pushed onto an AuditQueue.
//! A periodic job pops them in batches and writes each batch in one
//! transaction. A batch that fails to insert goes back on the queue.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    rbac::Principal,
    service::ServiceContext,
    store::{AuditFilter, AuditLogRow, Store},
    types::UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: i64 = 100;

const AUDITED_METHODS: [&str; 4] = ["POST", "PUT", "DELETE", "PATCH"];
const SKIPPED_PREFIXES: [&str; 4] = ["/api/v1/health", "/docs", "/redoc", "/content"];

const CSV_HEADER: [&str; 11] = [
    "ID",
    "Timestamp",
    "User ID",
    "Username",
    "Action",
    "Resource",
    "Resource ID",
    "Method",
    "Path",
    "Status Code",
    "IP Address",
];

/// One queued audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: Option<UserId>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub payload: Option<Value>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A finished request as seen by the web layer.
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub principal: Principal,
    pub ip_address: Option<String>,
    pub payload: Option<Value>,
}

// ── Queue ──────────────────────────────────────────────────────

/// List semantics: producers push at the front, the flusher pops from the
/// back, so entries come out oldest first.
pub trait AuditQueue: Send + Sync {
    fn push(&self, entry: String);
    fn pop(&self) -> Option<String>;
    /// Put entries back at the pop end, keeping their order.
    fn requeue(&self, entries: Vec<String>);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditQueue {
    items: Mutex<VecDeque<String>>,
}

impl MemoryAuditQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AuditQueue for MemoryAuditQueue {
    fn push(&self, entry: String) {
        self.items().push_front(entry);
    }

    fn pop(&self) -> Option<String> {
        self.items().pop_back()
    }

    fn requeue(&self, entries: Vec<String>) {
        let mut items = self.items();
        for entry in entries.into_iter().rev() {
            items.push_back(entry);
        }
    }

    fn len(&self) -> usize {
        self.items().len()
    }
}

// ── Flush ──────────────────────────────────────────────────────

/// Move up to `batch_size` queued entries into the database. Returns the
/// number written.
pub fn flush_queue(
    store: &Store,
    queue: &dyn AuditQueue,
    batch_size: usize,
    now: DateTime<Utc>,
) -> NexoResult<usize> {
    let mut raw = Vec::new();
    let mut entries = Vec::new();
    for _ in 0..batch_size {
        let Some(item) = queue.pop() else { break };
        match serde_json::from_str::<AuditEntry>(&item) {
            Ok(entry) => {
                entries.push(entry);
                raw.push(item);
            }
            Err(e) => log::error!("dropping unparsable audit entry: {e}"),
        }
    }
    if entries.is_empty() {
        return Ok(0);
    }

    match store.insert_audit_batch(&entries) {
        Ok(count) => {
            log::info!("flushed {count} audit logs to database");
            store.append_event(&DomainEvent::AuditLogsFlushed { count }, now)?;
            Ok(count)
        }
        Err(e) => {
            log::error!("failed to save audit logs, requeueing {}: {e}", raw.len());
            queue.requeue(raw);
            Err(e)
        }
    }
}

// ── Query ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub items: Vec<AuditLogRow>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// `parts[3]` of the path is the resource, `parts[4]` its id.
fn resource_of(path: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = path.split('/').collect();
    let resource = parts.get(3).map(|s| s.to_string()).unwrap_or_else(|| "root".to_string());
    let resource_id = parts.get(4).map(|s| s.to_string());
    (resource, resource_id)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    let mut line = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
    line.push_str("\r\n");
    line
}

pub struct AuditService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> AuditService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    /// Queue an entry for a mutating request. Returns whether it was queued.
    pub fn observe(&self, request: &AuditRequest) -> NexoResult<bool> {
        if !self.cx.config.audit.enabled {
            return Ok(false);
        }
        let method = request.method.to_ascii_uppercase();
        if !AUDITED_METHODS.contains(&method.as_str()) {
            return Ok(false);
        }
        if SKIPPED_PREFIXES.iter().any(|p| request.path.starts_with(p)) {
            return Ok(false);
        }

        let (resource, resource_id) = resource_of(&request.path);
        let entry = AuditEntry {
            user_id: request.principal.user_id(),
            action: format!("{method} {}", request.path),
            resource,
            resource_id,
            method,
            path: request.path.clone(),
            status_code: request.status_code,
            payload: request.payload.clone(),
            ip_address: request.ip_address.clone(),
            created_at: self.cx.now(),
        };
        self.cx.audit_queue.push(serde_json::to_string(&entry)?);
        Ok(true)
    }

    pub fn flush(&self, batch_size: usize) -> NexoResult<usize> {
        flush_queue(self.cx.store, self.cx.audit_queue, batch_size, self.cx.now())
    }

    pub fn pending(&self) -> usize {
        self.cx.audit_queue.len()
    }

    pub fn query(&self, filter: &AuditFilter, offset: i64, limit: i64) -> NexoResult<AuditPage> {
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(NexoError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if offset < 0 {
            return Err(NexoError::Validation("offset must not be negative".into()));
        }
        let total = self.cx.store.count_audit_logs(filter)?;
        let items = self.cx.store.audit_logs(filter, offset, Some(limit))?;
        Ok(AuditPage { items, total, limit, offset })
    }

    /// Every matching row, newest first, as CSV text.
    pub fn export_csv(&self, filter: &AuditFilter) -> NexoResult<String> {
        let header: Vec<String> = CSV_HEADER.iter().map(|h| h.to_string()).collect();
        let mut out = csv_row(&header);
        for row in self.cx.store.audit_logs(filter, 0, None)? {
            out.push_str(&csv_row(&[
                row.id.to_string(),
                row.created_at.to_rfc3339(),
                row.user_id.map(|id| id.to_string()).unwrap_or_else(|| "System".into()),
                row.username.unwrap_or_else(|| "System".into()),
                row.action,
                row.resource,
                row.resource_id.unwrap_or_default(),
                row.method,
                row.path,
                row.status_code.to_string(),
                row.ip_address.unwrap_or_default(),
            ]));
        }
        Ok(out)
    }
}
