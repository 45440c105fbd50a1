//! Password-only entry to the site and its admin area.
//!
//! Two shared passwords, no user rows. Their Argon2 hashes live in a small
//! JSON file; when the file is missing or incomplete it is bootstrapped from
//! the configured plaintexts, falling back to built-in defaults.

use crate::{
    config::SecurityConfig,
    error::{NexoError, NexoResult},
    rbac::Principal,
    rng::CodeRng,
    security::{hash_password, verify_password},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_SITE_PASSWORD: &str = "nexo-site-access";
const DEFAULT_ADMIN_PASSWORD: &str = "nexo-admin-access";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SiteAccessFile {
    site_password_hash: String,
    admin_password_hash: String,
}

pub struct SiteAccess {
    path: PathBuf,
    bootstrap_site: String,
    bootstrap_admin: String,
}

impl SiteAccess {
    pub fn new(security: &SecurityConfig) -> Self {
        Self {
            path: PathBuf::from(&security.site_access_file),
            bootstrap_site: security
                .site_password
                .clone()
                .unwrap_or_else(|| DEFAULT_SITE_PASSWORD.to_string()),
            bootstrap_admin: security
                .admin_password
                .clone()
                .unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Admin password wins over the site password when both match.
    pub fn resolve_login(&self, rng: &mut CodeRng, password: &str) -> NexoResult<Principal> {
        let hashes = self.read_or_bootstrap(rng)?;
        if verify_password(password, &hashes.admin_password_hash) {
            return Ok(Principal::SiteAdmin);
        }
        if verify_password(password, &hashes.site_password_hash) {
            return Ok(Principal::SiteMember);
        }
        Err(NexoError::Unauthorized)
    }

    /// Replace either password. Only the site admin may do this.
    pub fn update_passwords(
        &self,
        principal: Principal,
        rng: &mut CodeRng,
        site_password: Option<&str>,
        admin_password: Option<&str>,
    ) -> NexoResult<()> {
        if principal != Principal::SiteAdmin {
            return Err(NexoError::Forbidden("only the site admin can change access passwords".into()));
        }
        let mut hashes = self.read_or_bootstrap(rng)?;
        if let Some(site) = site_password {
            hashes.site_password_hash = hash_password(rng, site)?;
        }
        if let Some(admin) = admin_password {
            hashes.admin_password_hash = hash_password(rng, admin)?;
        }
        self.write(&hashes)
    }

    fn read_or_bootstrap(&self, rng: &mut CodeRng) -> NexoResult<SiteAccessFile> {
        if let Ok(content) = std::fs::read_to_string(&self.path) {
            match serde_json::from_str::<SiteAccessFile>(&content) {
                Ok(file)
                    if !file.site_password_hash.is_empty()
                        && !file.admin_password_hash.is_empty() =>
                {
                    return Ok(file)
                }
                Ok(_) => log::warn!("{} is incomplete, bootstrapping", self.path.display()),
                Err(e) => log::warn!("cannot parse {}: {e}, bootstrapping", self.path.display()),
            }
        }
        if self.bootstrap_site == DEFAULT_SITE_PASSWORD || self.bootstrap_admin == DEFAULT_ADMIN_PASSWORD {
            log::warn!("site access bootstrapped with a built-in default password");
        }
        let file = SiteAccessFile {
            site_password_hash: hash_password(rng, &self.bootstrap_site)?,
            admin_password_hash: hash_password(rng, &self.bootstrap_admin)?,
        };
        self.write(&file)?;
        Ok(file)
    }

    fn write(&self, file: &SiteAccessFile) -> NexoResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| NexoError::Internal(format!("cannot create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, json)
            .map_err(|e| NexoError::Internal(format!("cannot write {}: {e}", self.path.display())))?;
        Ok(())
    }
}
