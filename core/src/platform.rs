//! The Platform: owns the store and the shared handles and hands out
//! services.
//!
//! RULES:
//!   - One Platform per database connection. Background jobs reopen the
//!     store instead of sharing this one.
//!   - Services are cheap borrows; build one per operation.

use crate::{
    affiliate_service::AffiliateService,
    audit_service::{AuditQueue, AuditService, MemoryAuditQueue},
    clock::{Clock, SystemClock},
    config::PlatformConfig,
    course_service::CourseService,
    error::{NexoError, NexoResult},
    job::{AuditFlushJob, JobRunner},
    organization_service::{NewOrganization, OrganizationService},
    password_reset_service::{LogMailer, Mailer, PasswordResetService},
    payment_service::PaymentService,
    rbac::Principal,
    rbac_service::RbacService,
    rng::CodeRng,
    service::ServiceContext,
    site_access::SiteAccess,
    store::{is_memory_path, OrganizationRow, Store, UserRow},
    usage_service::UsageService,
    user_service::{NewUser, UserService},
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_ORG_SLUG: &str = "defaultorg";
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@school.dev";

/// First-run setup: default roles, one organization and its admin.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub org_name: String,
    pub org_slug: String,
    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
}

impl InstallRequest {
    /// The predefined install: "Default Organization" with an `admin` user.
    pub fn short(admin_email: Option<String>, admin_password: String) -> Self {
        Self {
            org_name: "Default Organization".into(),
            org_slug: DEFAULT_ORG_SLUG.into(),
            admin_username: "admin".into(),
            admin_email: admin_email.unwrap_or_else(|| DEFAULT_ADMIN_EMAIL.into()),
            admin_password,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Installed {
    pub organization: OrganizationRow,
    pub admin: UserRow,
}

pub struct Platform {
    store: Store,
    clock: Arc<dyn Clock>,
    rng: Mutex<CodeRng>,
    config: PlatformConfig,
    audit_queue: Arc<dyn AuditQueue>,
    mailer: Arc<dyn Mailer>,
}

impl Platform {
    /// Production wiring: configured database, wall clock, OS-seeded codes.
    pub fn open(config: PlatformConfig) -> NexoResult<Self> {
        let store = if is_memory_path(&config.database.path) {
            log::warn!("database '{}' is in memory; nothing will persist", config.database.path);
            Store::in_memory()?
        } else {
            if let Some(dir) = Path::new(&config.database.path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir).map_err(|e| {
                        NexoError::Internal(format!("cannot create {}: {e}", dir.display()))
                    })?;
                }
            }
            Store::open(&config.database.path)?
        };
        Self::with_parts(
            store,
            Arc::new(SystemClock),
            CodeRng::from_entropy(),
            config,
            Arc::new(MemoryAuditQueue::new()),
            Arc::new(LogMailer),
        )
    }

    /// In-memory platform with a given clock and seed.
    pub fn in_memory(clock: Arc<dyn Clock>, seed: u64) -> NexoResult<Self> {
        Self::with_parts(
            Store::in_memory()?,
            clock,
            CodeRng::seeded(seed),
            PlatformConfig::default_test(),
            Arc::new(MemoryAuditQueue::new()),
            Arc::new(LogMailer),
        )
    }

    /// Explicit wiring. Migrates the store.
    pub fn with_parts(
        store: Store,
        clock: Arc<dyn Clock>,
        rng: CodeRng,
        config: PlatformConfig,
        audit_queue: Arc<dyn AuditQueue>,
        mailer: Arc<dyn Mailer>,
    ) -> NexoResult<Self> {
        store.migrate()?;
        Ok(Self {
            store,
            clock,
            rng: Mutex::new(rng),
            config,
            audit_queue,
            mailer,
        })
    }

    pub fn cx(&self) -> ServiceContext<'_> {
        ServiceContext {
            store: &self.store,
            clock: self.clock.as_ref(),
            rng: &self.rng,
            config: &self.config,
            audit_queue: self.audit_queue.as_ref(),
            mailer: self.mailer.as_ref(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn audit_queue(&self) -> &Arc<dyn AuditQueue> {
        &self.audit_queue
    }

    // ── Services ───────────────────────────────────────────────

    pub fn rbac(&self) -> RbacService<'_> {
        RbacService::new(self.cx())
    }

    pub fn orgs(&self) -> OrganizationService<'_> {
        OrganizationService::new(self.cx())
    }

    pub fn users(&self) -> UserService<'_> {
        UserService::new(self.cx())
    }

    pub fn courses(&self) -> CourseService<'_> {
        CourseService::new(self.cx())
    }

    pub fn payments(&self) -> PaymentService<'_> {
        PaymentService::new(self.cx())
    }

    pub fn affiliates(&self) -> AffiliateService<'_> {
        AffiliateService::new(self.cx())
    }

    pub fn usage(&self) -> UsageService<'_> {
        UsageService::new(self.cx())
    }

    pub fn password_reset(&self) -> PasswordResetService<'_> {
        PasswordResetService::new(self.cx())
    }

    pub fn audit(&self) -> AuditService<'_> {
        AuditService::new(self.cx())
    }

    pub fn site_access(&self) -> SiteAccess {
        SiteAccess::new(&self.config.security)
    }

    /// Password-only login to the site or its admin area.
    pub fn site_login(&self, password: &str) -> NexoResult<Principal> {
        let access = self.site_access();
        self.cx().with_rng(|rng| access.resolve_login(rng, password))
    }

    pub fn update_site_passwords(
        &self,
        principal: Principal,
        site_password: Option<&str>,
        admin_password: Option<&str>,
    ) -> NexoResult<()> {
        let access = self.site_access();
        self.cx()
            .with_rng(|rng| access.update_passwords(principal, rng, site_password, admin_password))
    }

    // ── Install ────────────────────────────────────────────────

    pub fn install(&self, request: &InstallRequest) -> NexoResult<Installed> {
        self.rbac().install_default_roles()?;
        log::info!("default roles installed");

        let organization = self.orgs().create_organization(&NewOrganization {
            name: request.org_name.clone(),
            slug: request.org_slug.clone(),
            email: String::new(),
            description: "Default Organization".into(),
        })?;

        let admin = self.users().create_org_user(
            organization.id,
            &NewUser {
                username: request.admin_username.clone(),
                email: request.admin_email.clone(),
                password: request.admin_password.clone(),
                first_name: String::new(),
                last_name: String::new(),
            },
        )?;
        log::info!("installed '{}' with admin {}", organization.slug, admin.email);
        Ok(Installed { organization, admin })
    }

    // ── Jobs ───────────────────────────────────────────────────

    /// Start the periodic audit flush on its own connection, every
    /// `audit.flush_interval_secs`.
    pub fn spawn_audit_flusher(&self) -> NexoResult<JobRunner> {
        let secs = self.config.audit.flush_interval_secs.max(1);
        self.spawn_audit_flusher_every(Duration::from_secs(secs))
    }

    /// Fails for an in-memory store: the job's own connection would open a
    /// separate empty database and never persist anything.
    pub fn spawn_audit_flusher_every(&self, interval: Duration) -> NexoResult<JobRunner> {
        if self.store.is_in_memory() {
            return Err(NexoError::Validation(
                "the audit flusher needs a file-backed database".into(),
            ));
        }
        let job = AuditFlushJob::new(
            self.store.reopen()?,
            Arc::clone(&self.audit_queue),
            Arc::clone(&self.clock),
            self.config.audit.batch_size,
        );
        Ok(JobRunner::spawn(Box::new(job), interval))
    }
}
