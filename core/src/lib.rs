//! Nexo platform core: multi-tenant learning management with role-based
//! access, paid courses, an affiliate commission ledger and audit logging.
//!
//! The `Platform` wires the store, clock and queues together and hands out
//! one service per domain area.

pub mod affiliate_service;
pub mod audit_service;
pub mod clock;
pub mod config;
pub mod course_service;
pub mod error;
pub mod event;
pub mod job;
pub mod org_config;
pub mod organization_service;
pub mod password_reset_service;
pub mod payment_service;
pub mod platform;
pub mod rbac;
pub mod rbac_service;
pub mod rng;
pub mod security;
pub mod service;
pub mod site_access;
pub mod store;
pub mod types;
pub mod usage_service;
pub mod user_service;

pub use error::{NexoError, NexoResult};
pub use platform::Platform;
