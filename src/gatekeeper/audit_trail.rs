//! Audit Trail Emitter
//!
//! Best-effort append of security events and admin actions to the remote
//! audit log.
//!
//! - Never blocks or fails the triggering action: errors are logged with
//!   `tracing::warn!` and swallowed
//! - No local retry queue; a dropped event is an accepted loss
//! - Append-only; the client never reads its own history back

use crate::authority::{AdminActionRecord, RemoteAuthority, RiskLevel, SecurityEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Security event types emitted by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventKind {
    LoginSucceeded,
    LoginFailed,
    RateLimitExceeded,
    AdminAccessDenied,
    SessionExpired,
    SuspiciousActivity,
}

impl SecurityEventKind {
    /// Wire name stored in the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::LoginSucceeded => "login_succeeded",
            SecurityEventKind::LoginFailed => "login_failed",
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::AdminAccessDenied => "admin_access_denied",
            SecurityEventKind::SessionExpired => "session_expired",
            SecurityEventKind::SuspiciousActivity => "suspicious_activity",
        }
    }

    pub fn default_risk(&self) -> RiskLevel {
        match self {
            SecurityEventKind::LoginSucceeded | SecurityEventKind::SessionExpired => {
                RiskLevel::Low
            }
            SecurityEventKind::LoginFailed | SecurityEventKind::RateLimitExceeded => {
                RiskLevel::Medium
            }
            SecurityEventKind::AdminAccessDenied => RiskLevel::High,
            SecurityEventKind::SuspiciousActivity => RiskLevel::Critical,
        }
    }

    /// Event of this kind at its default risk level.
    pub fn event(&self) -> SecurityEvent {
        SecurityEvent::new(self.as_str(), self.default_risk())
    }
}

/// Fire-and-forget audit emitter.
#[derive(Clone)]
pub struct AuditTrail {
    authority: Arc<dyn RemoteAuthority>,
}

impl AuditTrail {
    pub fn new(authority: Arc<dyn RemoteAuthority>) -> Self {
        Self { authority }
    }

    /// Append a security event; failures are swallowed.
    pub async fn log_security_event(&self, event: SecurityEvent) {
        match self.authority.log_security_event(&event).await {
            Ok(()) => debug!(event_type = %event.event_type, "security event logged"),
            Err(e) => warn!(
                event_type = %event.event_type,
                risk = %event.risk_level,
                error = %e,
                "failed to log security event"
            ),
        }
    }

    /// Append an admin action; failures are swallowed.
    pub async fn log_admin_action(&self, record: AdminActionRecord) {
        match self.authority.log_admin_action(&record).await {
            Ok(()) => debug!(action = %record.action, "admin action logged"),
            Err(e) => warn!(
                action = %record.action,
                admin = %record.admin_id,
                error = %e,
                "failed to log admin action"
            ),
        }
    }

    /// Spawn the append so the caller never waits on the network.
    pub fn emit_security_event_detached(&self, event: SecurityEvent) -> JoinHandle<()> {
        let trail = self.clone();
        tokio::spawn(async move { trail.log_security_event(event).await })
    }

    pub fn emit_admin_action_detached(&self, record: AdminActionRecord) -> JoinHandle<()> {
        let trail = self.clone();
        tokio::spawn(async move { trail.log_admin_action(record).await })
    }

    /// Run a state-changing admin action, then log it if it succeeded.
    ///
    /// The action's result is returned unchanged whatever happens to the log
    /// append. Failed actions are not logged.
    pub async fn record_admin_action<F, T, E>(&self, record: AdminActionRecord, action: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let result = action.await;
        if result.is_ok() {
            self.emit_admin_action_detached(record);
        }
        result
    }
}
