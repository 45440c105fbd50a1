//! Shared primitive types used across the platform core.

use chrono::{DateTime, Utc};

/// Row id of an organization.
pub type OrgId = i64;

/// Row id of a user.
pub type UserId = i64;

/// Row id of any other persisted entity.
pub type RowId = i64;

/// Timestamps are persisted as epoch milliseconds.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Declares a field-less enum persisted as TEXT, with `as_str`, `FromStr`
/// and serde names matching the column values.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Roles & authorship ─────────────────────────────────────────

text_enum!(RoleType {
    Global => "global",
    Organization => "organization",
});

text_enum!(
    /// Authorship level of a user on a course.
    Authorship {
        Creator => "creator",
        Maintainer => "maintainer",
        Contributor => "contributor",
        Reporter => "reporter",
    }
);

text_enum!(AuthorStatus {
    Active => "active",
    Pending => "pending",
    Inactive => "inactive",
});

// ── Payments ───────────────────────────────────────────────────

text_enum!(ProductType {
    OneTime => "one_time",
    Subscription => "subscription",
});

text_enum!(PaymentStatus {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Failed => "failed",
    Refunded => "refunded",
});

impl PaymentStatus {
    /// Statuses that grant access to linked courses.
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Completed)
    }
}

// ── Affiliates ─────────────────────────────────────────────────

text_enum!(AttributionModel {
    FirstClick => "first_click",
    LastClick => "last_click",
});

text_enum!(
    /// Shared by affiliates and their codes.
    AffiliateStatus {
        Active => "active",
        Disabled => "disabled",
    }
);

text_enum!(CommissionStatus {
    Pending => "pending",
    Paid => "paid",
    Reversed => "reversed",
});
