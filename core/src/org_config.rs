//! Per-organization configuration blob.
//!
//! Stored as JSON on `organization_config`. The blob carries its own
//! `config_version`; older blobs are upgraded step by step when read and the
//! upgraded form is written back by the store.

use crate::error::{NexoError, NexoResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const CURRENT_VERSION: &str = "1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Courses,
    Members,
    Usergroups,
    Storage,
    Ai,
    Assignments,
    Payments,
    Discussions,
    Analytics,
    Collaboration,
    Api,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Courses => "courses",
            Self::Members => "members",
            Self::Usergroups => "usergroups",
            Self::Storage => "storage",
            Self::Ai => "ai",
            Self::Assignments => "assignments",
            Self::Payments => "payments",
            Self::Discussions => "discussions",
            Self::Analytics => "analytics",
            Self::Collaboration => "collaboration",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgGeneralConfig {
    pub enabled: bool,
    pub color: String,
    pub watermark: bool,
}

/// `limit == 0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub enabled: bool,
    #[serde(default)]
    pub limit: i64,
}

impl FeatureConfig {
    pub const fn unlimited() -> Self {
        Self { enabled: true, limit: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignupMode {
    Open,
    InviteOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub enabled: bool,
    pub signup_mode: SignupMode,
    pub admin_limit: i64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    #[serde(default)]
    pub limit: i64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgFeatureConfig {
    pub courses: FeatureConfig,
    pub members: MemberConfig,
    pub usergroups: FeatureConfig,
    pub storage: FeatureConfig,
    pub ai: AiConfig,
    pub assignments: FeatureConfig,
    pub payments: FeatureConfig,
    pub discussions: FeatureConfig,
    pub analytics: FeatureConfig,
    pub collaboration: FeatureConfig,
    pub api: FeatureConfig,
}

impl OrgFeatureConfig {
    /// Enabled flag and limit of one feature.
    pub fn get(&self, feature: Feature) -> FeatureConfig {
        match feature {
            Feature::Courses => self.courses,
            Feature::Members => FeatureConfig {
                enabled: self.members.enabled,
                limit: self.members.limit,
            },
            Feature::Usergroups => self.usergroups,
            Feature::Storage => self.storage,
            Feature::Ai => FeatureConfig { enabled: self.ai.enabled, limit: self.ai.limit },
            Feature::Assignments => self.assignments,
            Feature::Payments => self.payments,
            Feature::Discussions => self.discussions,
            Feature::Analytics => self.analytics,
            Feature::Collaboration => self.collaboration,
            Feature::Api => self.api,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgCloudConfig {
    pub plan: String,
    pub custom_domain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgConfig {
    pub config_version: String,
    pub general: OrgGeneralConfig,
    pub features: OrgFeatureConfig,
    pub cloud: OrgCloudConfig,
    #[serde(default)]
    pub landing: Value,
}

impl Default for OrgConfig {
    fn default() -> Self {
        Self {
            config_version: CURRENT_VERSION.to_string(),
            general: OrgGeneralConfig {
                enabled: true,
                color: "normal".into(),
                watermark: true,
            },
            features: OrgFeatureConfig {
                courses: FeatureConfig::unlimited(),
                members: MemberConfig {
                    enabled: true,
                    signup_mode: SignupMode::Open,
                    admin_limit: 0,
                    limit: 0,
                },
                usergroups: FeatureConfig::unlimited(),
                storage: FeatureConfig::unlimited(),
                ai: AiConfig { enabled: true, limit: 0, model: "gpt-4o-mini".into() },
                assignments: FeatureConfig::unlimited(),
                payments: FeatureConfig::unlimited(),
                discussions: FeatureConfig::unlimited(),
                analytics: FeatureConfig::unlimited(),
                collaboration: FeatureConfig::unlimited(),
                api: FeatureConfig::unlimited(),
            },
            cloud: OrgCloudConfig { plan: "free".into(), custom_domain: false },
            landing: json!({}),
        }
    }
}

/// Result of reading a stored blob.
#[derive(Debug, Clone)]
pub struct Migrated {
    pub config: OrgConfig,
    /// True when at least one upgrade step ran; the caller persists it.
    pub upgraded: bool,
}

/// Upgrade a stored blob to the current version.
///
/// A blob without `config_version` is treated as "1.0".
pub fn migrate(mut value: Value) -> NexoResult<Migrated> {
    let root = value
        .as_object_mut()
        .ok_or_else(|| NexoError::Validation("organization config must be an object".into()))?;

    let mut version = root
        .get("config_version")
        .and_then(Value::as_str)
        .unwrap_or("1.0")
        .to_string();
    let mut upgraded = false;

    while version != CURRENT_VERSION {
        version = match version.as_str() {
            "1.0" => {
                let members = feature_block(root, "members")?;
                insert_missing(members, "signup_mode", json!("open"));
                insert_missing(members, "admin_limit", json!(0));
                "1.1"
            }
            "1.1" => {
                for name in ["payments", "discussions", "analytics", "collaboration", "api"] {
                    let features = object_entry(root, "features")?;
                    insert_missing(features, name, json!({ "enabled": true, "limit": 0 }));
                }
                "1.2"
            }
            "1.2" => {
                insert_missing(root, "cloud", json!({ "plan": "free", "custom_domain": false }));
                insert_missing(root, "landing", json!({}));
                "1.3"
            }
            other => {
                return Err(NexoError::Validation(format!(
                    "unsupported organization config version: {other}"
                )))
            }
        }
        .to_string();
        upgraded = true;
        log::debug!("organization config upgraded to {version}");
    }

    root.insert("config_version".into(), json!(CURRENT_VERSION));
    let config: OrgConfig = serde_json::from_value(value)?;
    Ok(Migrated { config, upgraded })
}

fn object_entry<'a>(root: &'a mut Map<String, Value>, key: &str) -> NexoResult<&'a mut Map<String, Value>> {
    root.entry(key.to_string())
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| NexoError::Validation(format!("organization config '{key}' must be an object")))
}

fn feature_block<'a>(
    root: &'a mut Map<String, Value>,
    feature: &str,
) -> NexoResult<&'a mut Map<String, Value>> {
    let features = object_entry(root, "features")?;
    object_entry(features, feature)
}

fn insert_missing(target: &mut Map<String, Value>, key: &str, value: Value) {
    target.entry(key.to_string()).or_insert(value);
}
