//! Domain event journal.
//!
//! RULE: every state change a webhook retry or an operator may need to
//! reconstruct is recorded here. Services append events through the store.
//! The only read back is the payment handler asking whether a provider event
//! id was already journaled.

use crate::types::{OrgId, RowId, UserId};
use serde::{Deserialize, Serialize};

/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    // ── Tenancy ────────────────────────────────────
    OrganizationCreated {
        org_id: OrgId,
        slug: String,
    },
    UserSignedUp {
        org_id: OrgId,
        user_id: UserId,
        role_id: RowId,
    },
    MemberRoleChanged {
        org_id: OrgId,
        user_id: UserId,
        role_id: RowId,
    },
    PasswordChanged {
        org_id: OrgId,
        user_id: UserId,
    },

    // ── Content ────────────────────────────────────
    CourseCreated {
        org_id: OrgId,
        course_uuid: String,
        creator_id: Option<UserId>,
    },
    CourseDeleted {
        org_id: OrgId,
        course_uuid: String,
    },

    // ── Payments ───────────────────────────────────
    PaymentRecorded {
        org_id: OrgId,
        payment_user_id: RowId,
        provider_event_id: String,
        status: String,
    },

    // ── Affiliates ─────────────────────────────────
    AffiliateAttributed {
        org_id: OrgId,
        user_id: UserId,
        affiliate_id: RowId,
    },
    AttributionLocked {
        org_id: OrgId,
        user_id: UserId,
        affiliate_id: RowId,
    },
    CommissionRecorded {
        org_id: OrgId,
        commission_id: RowId,
        affiliate_id: RowId,
        amount_cents: i64,
        cycle_number: i64,
    },
    CommissionPaid {
        org_id: OrgId,
        commission_id: RowId,
    },
    CommissionReversed {
        org_id: OrgId,
        commission_id: RowId,
    },

    // ── Audit ──────────────────────────────────────
    AuditLogsFlushed {
        count: usize,
    },

    // ── Accounts ───────────────────────────────────
    PasswordUpdated {
        user_id: UserId,
    },
    UserDeleted {
        user_id: UserId,
        username: String,
    },
    InviteCodeCreated {
        org_id: OrgId,
        invite_code_uuid: String,
    },
}

impl DomainEvent {
    /// Stable name for the event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::OrganizationCreated { .. } => "organization_created",
            Self::UserSignedUp { .. }        => "user_signed_up",
            Self::MemberRoleChanged { .. }   => "member_role_changed",
            Self::PasswordChanged { .. }     => "password_changed",
            Self::CourseCreated { .. }       => "course_created",
            Self::CourseDeleted { .. }       => "course_deleted",
            Self::PaymentRecorded { .. }     => "payment_recorded",
            Self::AffiliateAttributed { .. } => "affiliate_attributed",
            Self::AttributionLocked { .. }   => "attribution_locked",
            Self::CommissionRecorded { .. }  => "commission_recorded",
            Self::CommissionPaid { .. }      => "commission_paid",
            Self::CommissionReversed { .. }  => "commission_reversed",
            Self::AuditLogsFlushed { .. }    => "audit_logs_flushed",
            Self::InviteCodeCreated { .. }   => "invite_code_created",
            Self::PasswordUpdated { .. }     => "password_updated",
            Self::UserDeleted { .. }         => "user_deleted",
        }
    }

    /// Owning organization, when the event has one.
    pub fn org_id(&self) -> Option<OrgId> {
        match self {
            Self::OrganizationCreated { org_id, .. }
            | Self::UserSignedUp { org_id, .. }
            | Self::MemberRoleChanged { org_id, .. }
            | Self::PasswordChanged { org_id, .. }
            | Self::InviteCodeCreated { org_id, .. }
            | Self::CourseCreated { org_id, .. }
            | Self::CourseDeleted { org_id, .. }
            | Self::PaymentRecorded { org_id, .. }
            | Self::AffiliateAttributed { org_id, .. }
            | Self::AttributionLocked { org_id, .. }
            | Self::CommissionRecorded { org_id, .. }
            | Self::CommissionPaid { org_id, .. }
            | Self::CommissionReversed { org_id, .. } => Some(*org_id),
            Self::AuditLogsFlushed { .. }
            | Self::PasswordUpdated { .. }
            | Self::UserDeleted { .. } => None,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub org_id: Option<OrgId>,
    pub event_type: String,
    pub payload: String, // JSON-serialized DomainEvent
    pub created_at: i64,
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<DomainEvent> {
        serde_json::from_str(&self.payload)
    }
}
