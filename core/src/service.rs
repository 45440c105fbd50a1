//! Shared handle passed to every service.
//!
//! RULE: services never own state. Each one borrows the store, clock and
//! code generator through a ServiceContext built by the Platform, records
//! its state changes as DomainEvents and returns.

use crate::{
    audit_service::AuditQueue,
    clock::Clock,
    config::PlatformConfig,
    error::NexoResult,
    event::DomainEvent,
    password_reset_service::Mailer,
    rng::CodeRng,
    store::Store,
};
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Clone, Copy)]
pub struct ServiceContext<'a> {
    pub store: &'a Store,
    pub clock: &'a dyn Clock,
    pub rng: &'a Mutex<CodeRng>,
    pub config: &'a PlatformConfig,
    pub audit_queue: &'a dyn AuditQueue,
    pub mailer: &'a dyn Mailer,
}

impl<'a> ServiceContext<'a> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` with exclusive access to the code generator.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut CodeRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut rng)
    }

    pub fn prefixed_uuid(&self, prefix: &str) -> String {
        self.with_rng(|rng| rng.prefixed_uuid(prefix))
    }

    /// Append to the event journal.
    pub fn emit(&self, event: DomainEvent) -> NexoResult<()> {
        log::debug!("event {}", event.event_type());
        self.store.append_event(&event, self.now())
    }
}
