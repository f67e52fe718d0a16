//! Gatekeeper module: client-side access control
//!
//! - Rate Limiter: fail-open checks against the remote rate-limit store
//! - Admin Gate: per-entry remote verification of admin privileges
//! - Session Monitor: expiry warning and forced sign-out
//! - Audit Trail: best-effort security and admin-action logging
//!
//! None of these hold global state. `AccessControl` wires them to one
//! authority and is passed to whoever needs it.

pub mod admin_gate;
pub mod audit_trail;
pub mod rate_limiter;
pub mod session_monitor;

pub use admin_gate::{
    ActionRequirement, AdminGate, AdminVerification, DenialReason, GateError, GateOutcome,
    GatePass, GateState, RecoveryAction, RenderScope, ScopeGuard,
};
pub use audit_trail::{AuditTrail, SecurityEventKind};
pub use rate_limiter::{
    format_duration, get_cooldown_duration, ActionClass, RateLimitClient, RateLimitConfig,
    RateLimitDecision, RateLimitError,
};
pub use session_monitor::{
    MonitorConfig, MonitorError, MonitorHandle, SessionEvent, SessionMonitor, SignOutReason,
    TickOutcome,
};

use crate::authority::{RemoteAuthority, SessionAccessor};
use crate::identity::IdentifierKey;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The four gatekeeper services bound to one remote authority.
pub struct AccessControl {
    pub audit: AuditTrail,
    pub rate_limits: RateLimitClient,
    pub admin_gate: AdminGate,
    pub session_monitor: Arc<SessionMonitor>,
}

impl AccessControl {
    /// Build all services; returns the session event stream alongside.
    pub fn new(
        authority: Arc<dyn RemoteAuthority>,
        accessor: Arc<dyn SessionAccessor>,
        key: IdentifierKey,
        installation_id: impl Into<String>,
        monitor: MonitorConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let audit = AuditTrail::new(Arc::clone(&authority));
        let rate_limits = RateLimitClient::new(Arc::clone(&authority), key, installation_id)
            .with_audit(audit.clone());
        let admin_gate = AdminGate::new(authority).with_audit(audit.clone());
        let (session_monitor, events) = SessionMonitor::new(accessor, monitor);
        let session_monitor = Arc::new(session_monitor.with_audit(audit.clone()));

        (
            Self {
                audit,
                rate_limits,
                admin_gate,
                session_monitor,
            },
            events,
        )
    }
}
