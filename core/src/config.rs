//! Platform configuration.
//!
//! Loaded from a JSON file, then overridden by `NEXO_*` environment
//! variables. The first non-empty variable of each group wins.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_PATH: &str = "data/nexo.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub development_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path or URI. `:memory:` keeps everything in process and is
    /// only meant for tests.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Salt mixed into affiliate click IP hashes.
    pub affiliate_ip_salt: String,
    /// JSON file holding the site/admin access password hashes.
    pub site_access_file: String,
    /// Plaintext used once to bootstrap the site access file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    pub flush_interval_secs: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingConfig {
    pub system_email_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub mailing: MailingConfig,
}

impl PlatformConfig {
    /// Read `path`, then apply environment overrides.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let mut config: PlatformConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for when no file is present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Split out so tests need not
    /// touch the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| lookup(k))
                .find(|v| !v.trim().is_empty())
        };

        if let Some(v) = first(&["NEXO_DEVELOPMENT_MODE"]) {
            self.general.development_mode = matches!(v.trim(), "1" | "true" | "True");
        }
        if let Some(v) = first(&["NEXO_SQL_CONNECTION_STRING", "NEXO_DATABASE_PATH"]) {
            self.database.path = v;
        }
        if let Some(v) = first(&["NEXO_AFFILIATE_IP_SALT"]) {
            self.security.affiliate_ip_salt = v;
        }
        if let Some(v) = first(&["NEXO_SITE_ACCESS_FILE"]) {
            self.security.site_access_file = v.trim().to_string();
        }
        if let Some(v) = first(&["NEXO_SITE_PASSWORD"]) {
            self.security.site_password = Some(v.trim().to_string());
        }
        if let Some(v) = first(&["NEXO_ADMIN_PASSWORD"]) {
            self.security.admin_password = Some(v.trim().to_string());
        }
        if let Some(v) = first(&["NEXO_AUDIT_ENABLED"]) {
            self.audit.enabled = matches!(v.trim(), "1" | "true" | "True");
        }
        if let Some(secs) = first(&["NEXO_AUDIT_FLUSH_INTERVAL"]).and_then(|v| v.trim().parse().ok()) {
            self.audit.flush_interval_secs = secs;
        }
        if let Some(v) = first(&["NEXO_SYSTEM_EMAIL_ADDRESS"]) {
            self.mailing.system_email_address = v;
        }
    }

    /// In-memory database, audit enabled, no environment.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.database.path = ":memory:".into();
        config
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig { development_mode: false },
            database: DatabaseConfig { path: DEFAULT_DATABASE_PATH.into() },
            security: SecurityConfig {
                affiliate_ip_salt: "nexo_affiliate_salt".into(),
                site_access_file: "data/site_access.json".into(),
                site_password: None,
                admin_password: None,
            },
            audit: AuditConfig {
                enabled: true,
                flush_interval_secs: 60,
                batch_size: 100,
            },
            mailing: MailingConfig {
                system_email_address: "no-reply@nexo.local".into(),
            },
        }
    }
}
