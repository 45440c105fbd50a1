//! Password reset by emailed one-hour codes.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    rng::RESET_ALPHABET,
    security::hash_password,
    service::ServiceContext,
    types::OrgId,
    user_service::validate_password,
};
use chrono::Duration;

pub const RESET_CODE_LENGTH: usize = 5;
pub const RESET_CODE_TTL_MINUTES: i64 = 60;

/// Outbound email.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> NexoResult<()>;
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> NexoResult<()> {
        log::info!("mail to {to}: {subject}");
        Ok(())
    }
}

pub struct PasswordResetService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> PasswordResetService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    /// Email a reset code. Unknown addresses succeed silently so callers
    /// cannot learn which emails have accounts.
    pub fn send_reset_code(&self, org_id: OrgId, email: &str) -> NexoResult<()> {
        if org_id <= 0 {
            return Err(NexoError::BadRequest("invalid org_id".into()));
        }
        let org = self
            .cx
            .store
            .organization(org_id)?
            .ok_or_else(|| NexoError::BadRequest("organization not found".into()))?;
        let email = email.trim().to_lowercase();
        let Some(user) = self.cx.store.user_by_email(&email)? else {
            log::info!("reset code requested for unknown email in org {org_id}");
            return Ok(());
        };

        let code = self.cx.with_rng(|rng| rng.code(RESET_ALPHABET, RESET_CODE_LENGTH));
        let now = self.cx.now();
        let expires_at = now + Duration::minutes(RESET_CODE_TTL_MINUTES);
        self.cx
            .store
            .insert_reset_code(user.id, org_id, &code, expires_at, now)?;

        let subject = format!("Reset your password for {}", org.name);
        let greeting = if user.first_name.trim().is_empty() {
            &user.username
        } else {
            &user.first_name
        };
        let body = format!(
            "Hello {greeting},\n\nYour password reset code is {code}. It expires in one hour.\n"
        );
        self.cx.mailer.send(&user.email, &subject, &body).map_err(|e| {
            log::error!("reset email to user {} failed: {e}", user.id);
            NexoError::Internal("failed to send reset email".into())
        })?;
        log::info!("reset code sent to user {} in org {org_id}", user.id);
        Ok(())
    }

    pub fn change_password_with_reset_code(
        &self,
        org_id: OrgId,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> NexoResult<()> {
        let user = self
            .cx
            .store
            .user_by_email(&email.trim().to_lowercase())?
            .ok_or_else(|| NexoError::BadRequest("user does not exist".into()))?;
        self.cx
            .store
            .organization(org_id)?
            .ok_or_else(|| NexoError::BadRequest("organization not found".into()))?;
        let record = self
            .cx
            .store
            .reset_code(user.id, org_id, code.trim())?
            .ok_or_else(|| NexoError::BadRequest("invalid reset code".into()))?;
        if record.expires_at < self.cx.now() {
            self.cx.store.delete_reset_code(record.id)?;
            return Err(NexoError::BadRequest("reset code has expired".into()));
        }
        validate_password(new_password)?;

        let password_hash = self.cx.with_rng(|rng| hash_password(rng, new_password))?;
        self.cx
            .store
            .consume_reset_code(record.id, user.id, &password_hash, self.cx.now())?;
        self.cx.emit(DomainEvent::PasswordChanged { org_id, user_id: user.id })?;
        log::info!("password changed for user {} via reset code", user.id);
        Ok(())
    }
}
