//! Role-based access control.
//!
//! A role carries a Rights document: one permission block per resource kind.
//! The decision itself ([`decide`]) is pure; `rbac_service` gathers the facts
//! (public flag, authorship, the caller's roles) from the store.
//!
//! Decision order:
//!   1. Site admin passes everything.
//!   2. Anonymous callers may only read public elements.
//!   3. Site members (password-only access) may read public elements, never
//!      mutate.
//!   4. Authorship on the element (or its course) grants by authorship level.
//!   5. Any role of the caller in the element's organization granting the
//!      action passes; for courses the `*_own` flags pass for authors.

pub use crate::types::Authorship;

use crate::{
    error::{NexoError, NexoResult},
    types::UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> NexoResult<Self> {
        match raw {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(NexoError::Validation(format!("unknown action: {other}"))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource kind, derived from the uuid prefix of the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Course,
    Chapter,
    Activity,
    User,
    Organization,
    Role,
    Collection,
    UserGroup,
}

impl ElementKind {
    pub fn from_uuid(uuid: &str) -> NexoResult<Self> {
        let prefix = uuid.split_once('_').map(|(p, _)| p).unwrap_or_default();
        match prefix {
            "course" => Ok(Self::Course),
            "chapter" => Ok(Self::Chapter),
            "activity" => Ok(Self::Activity),
            "user" => Ok(Self::User),
            "org" => Ok(Self::Organization),
            "role" => Ok(Self::Role),
            "collection" => Ok(Self::Collection),
            "usergroup" => Ok(Self::UserGroup),
            _ => Err(NexoError::Validation(format!(
                "cannot determine element type of '{uuid}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permission {
    pub action_create: bool,
    pub action_read: bool,
    pub action_update: bool,
    pub action_delete: bool,
}

impl Permission {
    pub const fn all() -> Self {
        Self { action_create: true, action_read: true, action_update: true, action_delete: true }
    }

    pub const fn none() -> Self {
        Self { action_create: false, action_read: false, action_update: false, action_delete: false }
    }

    pub const fn read_only() -> Self {
        Self { action_create: false, action_read: true, action_update: false, action_delete: false }
    }

    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::Create => self.action_create,
            Action::Read => self.action_read,
            Action::Update => self.action_update,
            Action::Delete => self.action_delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionsWithOwn {
    pub action_create: bool,
    pub action_read: bool,
    pub action_read_own: bool,
    pub action_update: bool,
    pub action_update_own: bool,
    pub action_delete: bool,
    pub action_delete_own: bool,
}

impl PermissionsWithOwn {
    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::Create => self.action_create,
            Action::Read => self.action_read,
            Action::Update => self.action_update,
            Action::Delete => self.action_delete,
        }
    }

    /// Rights that only apply to elements the caller authored.
    pub fn allows_own(&self, action: Action) -> bool {
        match action {
            Action::Create => self.action_create,
            Action::Read => self.action_read_own,
            Action::Update => self.action_update_own,
            Action::Delete => self.action_delete_own,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DashboardPermission {
    pub action_access: bool,
}

/// The rights document stored on every role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rights {
    pub courses: PermissionsWithOwn,
    pub users: Permission,
    pub usergroups: Permission,
    pub collections: Permission,
    pub organizations: Permission,
    pub coursechapters: Permission,
    pub activities: Permission,
    pub roles: Permission,
    pub dashboard: DashboardPermission,
}

impl Rights {
    pub fn allows(&self, kind: ElementKind, action: Action) -> bool {
        match kind {
            ElementKind::Course => self.courses.allows(action),
            ElementKind::Chapter => self.coursechapters.allows(action),
            ElementKind::Activity => self.activities.allows(action),
            ElementKind::User => self.users.allows(action),
            ElementKind::Organization => self.organizations.allows(action),
            ElementKind::Role => self.roles.allows(action),
            ElementKind::Collection => self.collections.allows(action),
            ElementKind::UserGroup => self.usergroups.allows(action),
        }
    }

    /// Course rights for authored courses. Other kinds have no "own" flags.
    pub fn allows_own(&self, kind: ElementKind, action: Action) -> bool {
        kind == ElementKind::Course && self.courses.allows_own(action)
    }

    pub fn admin() -> Self {
        Self {
            courses: PermissionsWithOwn {
                action_create: true,
                action_read: true,
                action_read_own: true,
                action_update: true,
                action_update_own: true,
                action_delete: true,
                action_delete_own: true,
            },
            users: Permission::all(),
            usergroups: Permission::all(),
            collections: Permission::all(),
            organizations: Permission::all(),
            coursechapters: Permission::all(),
            activities: Permission::all(),
            roles: Permission::all(),
            dashboard: DashboardPermission { action_access: true },
        }
    }

    pub fn maintainer() -> Self {
        Self {
            users: Permission { action_delete: false, ..Permission::all() },
            organizations: Permission::read_only(),
            roles: Permission::read_only(),
            ..Self::admin()
        }
    }

    pub fn instructor() -> Self {
        Self {
            courses: PermissionsWithOwn {
                action_create: true,
                action_read: true,
                action_read_own: true,
                action_update: false,
                action_update_own: true,
                action_delete: false,
                action_delete_own: true,
            },
            users: Permission::none(),
            usergroups: Permission::read_only(),
            collections: Permission { action_create: true, ..Permission::read_only() },
            organizations: Permission::none(),
            coursechapters: Permission { action_create: true, ..Permission::read_only() },
            activities: Permission { action_create: true, ..Permission::read_only() },
            roles: Permission::none(),
            dashboard: DashboardPermission { action_access: true },
        }
    }

    pub fn learner() -> Self {
        Self {
            courses: PermissionsWithOwn {
                action_create: false,
                action_read: true,
                action_read_own: true,
                action_update: false,
                action_update_own: false,
                action_delete: false,
                action_delete_own: true,
            },
            users: Permission::none(),
            usergroups: Permission::read_only(),
            collections: Permission::read_only(),
            organizations: Permission::none(),
            coursechapters: Permission::read_only(),
            activities: Permission::read_only(),
            roles: Permission::none(),
            dashboard: DashboardPermission { action_access: false },
        }
    }
}

/// Role ids of the global defaults. Ids are stable; memberships refer to them.
pub const ROLE_ADMIN: i64 = 1;
pub const ROLE_MAINTAINER: i64 = 2;
pub const ROLE_INSTRUCTOR: i64 = 3;
pub const ROLE_USER: i64 = 4;

#[derive(Debug, Clone)]
pub struct DefaultRole {
    pub id: i64,
    pub role_uuid: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub rights: Rights,
}

pub fn default_roles() -> Vec<DefaultRole> {
    vec![
        DefaultRole {
            id: ROLE_ADMIN,
            role_uuid: "role_global_admin",
            name: "Admin",
            description: "Full platform control",
            rights: Rights::admin(),
        },
        DefaultRole {
            id: ROLE_MAINTAINER,
            role_uuid: "role_global_maintainer",
            name: "Maintainer",
            description: "Mid-level manager, wide permissions but no platform control",
            rights: Rights::maintainer(),
        },
        DefaultRole {
            id: ROLE_INSTRUCTOR,
            role_uuid: "role_global_instructor",
            name: "Instructor",
            description: "Can manage their own content",
            rights: Rights::instructor(),
        },
        DefaultRole {
            id: ROLE_USER,
            role_uuid: "role_global_user",
            name: "User",
            description: "Read-Only Learner",
            rights: Rights::learner(),
        },
    ]
}

/// Chapters and activities inherit the authorship of their course.
impl Authorship {
    pub fn allows(&self, action: Action) -> bool {
        match self {
            Self::Creator | Self::Maintainer => true,
            Self::Contributor => matches!(action, Action::Read | Action::Update),
            Self::Reporter => action == Action::Read,
        }
    }
}

/// Who is making the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    /// Password-only site entry; no user row.
    SiteMember,
    /// Password-only admin entry; no user row.
    SiteAdmin,
    User(UserId),
}

impl Principal {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }
}

/// Everything the decision needs to know about one element and one caller.
#[derive(Debug, Clone, Default)]
pub struct AccessFacts {
    /// Public course (or a chapter/activity of one), or an organization.
    pub is_public: bool,
    /// The element is the caller's own user record.
    pub is_self: bool,
    /// Active authorship of the caller on the element or its course.
    pub authorship: Option<Authorship>,
    /// Rights of every role the caller holds in the element's organization.
    pub role_rights: Vec<Rights>,
}

pub fn decide(
    principal: Principal,
    kind: ElementKind,
    action: Action,
    facts: &AccessFacts,
) -> NexoResult<()> {
    match principal {
        Principal::SiteAdmin => Ok(()),
        Principal::Anonymous => {
            if action == Action::Read && facts.is_public {
                Ok(())
            } else {
                Err(NexoError::Unauthorized)
            }
        }
        Principal::SiteMember => {
            if action == Action::Read && facts.is_public {
                Ok(())
            } else {
                Err(forbidden(kind, action))
            }
        }
        Principal::User(_) => {
            if action == Action::Read && facts.is_public {
                return Ok(());
            }
            if facts.is_self && matches!(action, Action::Read | Action::Update) {
                return Ok(());
            }
            if facts.authorship.is_some_and(|a| a.allows(action)) {
                return Ok(());
            }
            let is_author = facts.authorship.is_some();
            let granted = facts.role_rights.iter().any(|rights| {
                rights.allows(kind, action) || (is_author && rights.allows_own(kind, action))
            });
            if granted {
                Ok(())
            } else {
                Err(forbidden(kind, action))
            }
        }
    }
}

fn forbidden(kind: ElementKind, action: Action) -> NexoError {
    NexoError::Forbidden(format!("not allowed to {action} {kind:?}").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_kind_comes_from_prefix() {
        assert_eq!(ElementKind::from_uuid("course_abc").unwrap(), ElementKind::Course);
        assert_eq!(ElementKind::from_uuid("org_1").unwrap(), ElementKind::Organization);
        assert!(ElementKind::from_uuid("nonsense").is_err());
    }

    #[test]
    fn rights_round_trip_through_json() {
        let json = serde_json::to_string(&Rights::instructor()).unwrap();
        let back: Rights = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Rights::instructor());
    }
}
