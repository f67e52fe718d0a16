//! Admin access gate.
//!
//! Every entry into a protected view re-verifies with the remote authority;
//! there is no cached "verified" state between entries.
//!
//! ```text
//! Unverified ──> Verifying ──> Verified
//!     │              │
//!     └──> Denied <──┘
//! ```
//!
//! The local `is_admin` claim is only a pre-filter that can deny without a
//! network call. It can never grant access on its own. Any remote error or
//! negative answer is a denial (fail closed).

use super::audit_trail::{AuditTrail, SecurityEventKind};
use crate::authority::{unix_now, RemoteAuthority, Session};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Unverified,
    Verifying,
    Verified,
    Denied(DenialReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Local claim says not an admin. No remote call was made.
    NotAdmin,
    /// The authority does not recognize the subject as an admin.
    StatusRejected,
    /// The subject is an admin but not for this action.
    ActionRejected { action: String },
    /// Verification could not complete.
    RemoteFailure(String),
}

impl DenialReason {
    /// True when the authority itself was consulted.
    pub fn is_remote(&self) -> bool {
        !matches!(self, DenialReason::NotAdmin)
    }

    fn code(&self) -> &'static str {
        match self {
            DenialReason::NotAdmin => "not_admin",
            DenialReason::StatusRejected => "status_rejected",
            DenialReason::ActionRejected { .. } => "action_rejected",
            DenialReason::RemoteFailure(_) => "remote_failure",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NotAdmin => write!(f, "Admin privileges required"),
            DenialReason::StatusRejected => write!(f, "Admin status could not be confirmed"),
            DenialReason::ActionRejected { action } => {
                write!(f, "Not authorized to perform '{}'", action)
            }
            DenialReason::RemoteFailure(_) => write!(f, "Unable to verify admin access"),
        }
    }
}

/// A specific privileged action the view needs on top of admin status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequirement {
    pub action: String,
    pub target: Option<String>,
}

impl ActionRequirement {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: None,
        }
    }

    pub fn on_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminVerification {
    pub verified: bool,
    /// `None` when no action was requested.
    pub action_authorized: Option<bool>,
    pub checked_at: u64,
}

/// What the UI offers on a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    NavigateHome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Render the protected content.
    Render(AdminVerification),
    Denied {
        reason: DenialReason,
        recovery: RecoveryAction,
    },
    /// No session; verification never started.
    RedirectToLogin,
    /// The view went away before verification settled.
    Abandoned,
}

impl GateOutcome {
    pub fn is_render(&self) -> bool {
        matches!(self, GateOutcome::Render(_))
    }

    fn denied(reason: DenialReason) -> Self {
        GateOutcome::Denied {
            reason,
            recovery: RecoveryAction::NavigateHome,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Illegal gate transition from {from:?} to {to:?}")]
    IllegalTransition { from: GateState, to: GateState },
}

/// The state machine for one entry into a protected view.
#[derive(Debug, Clone)]
pub struct GatePass {
    state: GateState,
    history: Vec<GateState>,
}

impl Default for GatePass {
    fn default() -> Self {
        Self::new()
    }
}

impl GatePass {
    pub fn new() -> Self {
        Self {
            state: GateState::Unverified,
            history: vec![GateState::Unverified],
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    /// Every state this pass went through, in order.
    pub fn history(&self) -> &[GateState] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, GateState::Verified | GateState::Denied(_))
    }

    fn is_legal(from: &GateState, to: &GateState) -> bool {
        matches!(
            (from, to),
            (GateState::Unverified, GateState::Verifying)
                | (GateState::Unverified, GateState::Denied(_))
                | (GateState::Verifying, GateState::Verified)
                | (GateState::Verifying, GateState::Denied(_))
        )
    }

    pub fn transition(&mut self, next: GateState) -> Result<(), GateError> {
        if !Self::is_legal(&self.state, &next) {
            return Err(GateError::IllegalTransition {
                from: self.state.clone(),
                to: next,
            });
        }
        self.advance(next);
        Ok(())
    }

    // Only called along the fixed path in `AdminGate::run`.
    fn advance(&mut self, next: GateState) {
        debug_assert!(Self::is_legal(&self.state, &next));
        self.history.push(next.clone());
        self.state = next;
    }
}

/// Lifetime of the view that asked for verification.
///
/// Cancelled when its `ScopeGuard` is cancelled or dropped. A detached scope
/// never cancels.
#[derive(Debug, Clone)]
pub struct RenderScope {
    alive: Option<watch::Receiver<bool>>,
}

/// Owning side of a `RenderScope`.
#[derive(Debug)]
pub struct ScopeGuard {
    cancelled: watch::Sender<bool>,
}

impl RenderScope {
    pub fn new() -> (ScopeGuard, RenderScope) {
        let (cancelled, alive) = watch::channel(false);
        (ScopeGuard { cancelled }, RenderScope { alive: Some(alive) })
    }

    pub fn detached() -> Self {
        Self { alive: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.alive {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolves once the scope is torn down.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.alive else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ScopeGuard {
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }
}

/// Admin gate.
#[derive(Clone)]
pub struct AdminGate {
    authority: Arc<dyn RemoteAuthority>,
    audit: Option<AuditTrail>,
}

impl AdminGate {
    pub fn new(authority: Arc<dyn RemoteAuthority>) -> Self {
        Self {
            authority,
            audit: None,
        }
    }

    /// Log `admin_access_denied` events for remote denials.
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Verify on entry to a protected view.
    pub async fn enter(
        &self,
        session: Option<&Session>,
        requirement: Option<&ActionRequirement>,
    ) -> GateOutcome {
        let mut pass = GatePass::new();
        self.run(&mut pass, session, requirement).await
    }

    /// Like `enter`, but the result is discarded if `scope` is torn down
    /// first.
    pub async fn enter_scoped(
        &self,
        session: Option<&Session>,
        requirement: Option<&ActionRequirement>,
        scope: &RenderScope,
    ) -> GateOutcome {
        let mut pass = GatePass::new();
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!("render scope torn down, discarding admin verification");
                GateOutcome::Abandoned
            }
            outcome = self.run(&mut pass, session, requirement) => outcome,
        }
    }

    /// Drive `pass` from `Unverified` to a terminal state. A pass that
    /// already settled is restarted.
    pub async fn run(
        &self,
        pass: &mut GatePass,
        session: Option<&Session>,
        requirement: Option<&ActionRequirement>,
    ) -> GateOutcome {
        if *pass.state() != GateState::Unverified {
            *pass = GatePass::new();
        }

        let Some(session) = session else {
            return GateOutcome::RedirectToLogin;
        };

        if !session.is_admin {
            return self.deny(pass, &session.subject_id, DenialReason::NotAdmin);
        }

        pass.advance(GateState::Verifying);
        let subject = session.subject_id.as_str();

        match self.authority.validate_admin_status(subject).await {
            Ok(true) => {}
            Ok(false) => return self.deny(pass, subject, DenialReason::StatusRejected),
            Err(e) => {
                warn!(subject, error = %e, "admin status check failed");
                return self.deny(pass, subject, DenialReason::RemoteFailure(e.to_string()));
            }
        }

        let action_authorized = match requirement {
            None => None,
            Some(req) => match self
                .authority
                .validate_admin_action(subject, &req.action, req.target.as_deref())
                .await
            {
                Ok(true) => Some(true),
                Ok(false) => {
                    let reason = DenialReason::ActionRejected {
                        action: req.action.clone(),
                    };
                    return self.deny(pass, subject, reason);
                }
                Err(e) => {
                    warn!(subject, action = %req.action, error = %e, "admin action check failed");
                    return self.deny(pass, subject, DenialReason::RemoteFailure(e.to_string()));
                }
            },
        };

        pass.advance(GateState::Verified);
        info!(subject, "admin access verified");

        GateOutcome::Render(AdminVerification {
            verified: true,
            action_authorized,
            checked_at: unix_now(),
        })
    }

    fn deny(&self, pass: &mut GatePass, subject: &str, reason: DenialReason) -> GateOutcome {
        pass.advance(GateState::Denied(reason.clone()));

        if reason.is_remote() {
            info!(subject, reason = reason.code(), "admin access denied");
            if let Some(audit) = &self.audit {
                let mut details = serde_json::json!({ "reason": reason.code() });
                if let DenialReason::ActionRejected { action } = &reason {
                    details["action"] = serde_json::Value::String(action.clone());
                }
                audit.emit_security_event_detached(
                    SecurityEventKind::AdminAccessDenied
                        .event()
                        .with_subject(subject)
                        .with_details(details),
                );
            }
        } else {
            debug!(subject, "admin claim absent, denied without remote check");
        }

        GateOutcome::denied(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::mock::{AuthorityCall, MockAuthority, Operation};
    use crate::authority::RiskLevel;
    use proptest::prelude::*;
    use std::time::Duration;

    fn session(subject: &str, is_admin: bool) -> Session {
        Session {
            subject_id: subject.to_string(),
            email: None,
            access_token: "access".to_string(),
            refresh_token: None,
            issued_at: unix_now(),
            expires_at: unix_now() + 3600,
            is_admin,
        }
    }

    fn gate(authority: &MockAuthority) -> AdminGate {
        AdminGate::new(Arc::new(authority.clone()))
    }

    #[tokio::test]
    async fn test_no_session_redirects_to_login() {
        let authority = MockAuthority::new();
        let outcome = gate(&authority).enter(None, None).await;

        assert_eq!(outcome, GateOutcome::RedirectToLogin);
        assert!(authority.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_claim_denies_without_remote_call() {
        let authority = MockAuthority::new();
        authority.grant_admin("user-1");

        let outcome = gate(&authority)
            .enter(Some(&session("user-1", false)), None)
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Denied {
                reason: DenialReason::NotAdmin,
                recovery: RecoveryAction::NavigateHome,
            }
        );
        assert!(authority.verification_calls().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_claim_is_rejected_remotely() {
        let authority = MockAuthority::new();

        let outcome = gate(&authority)
            .enter(Some(&session("user-1", true)), None)
            .await;

        assert!(matches!(
            outcome,
            GateOutcome::Denied {
                reason: DenialReason::StatusRejected,
                ..
            }
        ));
        assert_eq!(authority.verification_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_verified_admin_renders() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");

        let outcome = gate(&authority)
            .enter(Some(&session("admin-1", true)), None)
            .await;

        match outcome {
            GateOutcome::Render(v) => {
                assert!(v.verified);
                assert_eq!(v.action_authorized, None);
            }
            other => panic!("expected Render, got {:?}", other),
        }
        assert_eq!(
            authority.calls(),
            vec![AuthorityCall::AdminStatus {
                subject_id: "admin-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_scoped_action_checked_after_status() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        authority.grant_action("admin-1", "suspend_user");
        let requirement = ActionRequirement::new("suspend_user").on_target("user-42");

        let outcome = gate(&authority)
            .enter(Some(&session("admin-1", true)), Some(&requirement))
            .await;

        assert!(outcome.is_render());
        assert_eq!(
            authority.verification_calls(),
            vec![
                AuthorityCall::AdminStatus {
                    subject_id: "admin-1".to_string()
                },
                AuthorityCall::AdminAction {
                    subject_id: "admin-1".to_string(),
                    action: "suspend_user".to_string(),
                    target: Some("user-42".to_string()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_status_failure_skips_action_check() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        authority.fail(Operation::AdminStatus);
        let requirement = ActionRequirement::new("suspend_user");

        let outcome = gate(&authority)
            .enter(Some(&session("admin-1", true)), Some(&requirement))
            .await;

        assert!(matches!(
            outcome,
            GateOutcome::Denied {
                reason: DenialReason::RemoteFailure(_),
                ..
            }
        ));
        assert_eq!(authority.verification_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_action_rejected() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let requirement = ActionRequirement::new("delete_listing");

        let outcome = gate(&authority)
            .enter(Some(&session("admin-1", true)), Some(&requirement))
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Denied {
                reason: DenialReason::ActionRejected {
                    action: "delete_listing".to_string()
                },
                recovery: RecoveryAction::NavigateHome,
            }
        );
    }

    #[tokio::test]
    async fn test_action_check_failure_denies() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        authority.grant_action("admin-1", "refund");
        authority.fail(Operation::AdminAction);

        let outcome = gate(&authority)
            .enter(
                Some(&session("admin-1", true)),
                Some(&ActionRequirement::new("refund")),
            )
            .await;

        assert!(!outcome.is_render());
    }

    #[tokio::test]
    async fn test_every_entry_reverifies() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let gate = gate(&authority);
        let admin = session("admin-1", true);

        assert!(gate.enter(Some(&admin), None).await.is_render());
        assert!(gate.enter(Some(&admin), None).await.is_render());
        assert_eq!(authority.verification_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_run_records_path() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let mut pass = GatePass::new();

        gate(&authority)
            .run(&mut pass, Some(&session("admin-1", true)), None)
            .await;

        assert_eq!(
            pass.history(),
            &[
                GateState::Unverified,
                GateState::Verifying,
                GateState::Verified
            ]
        );
        assert!(pass.is_terminal());
    }

    #[tokio::test]
    async fn test_settled_pass_restarts_from_unverified() {
        let authority = MockAuthority::new();
        let mut pass = GatePass::new();
        let gate = gate(&authority);

        gate.run(&mut pass, Some(&session("user-1", false)), None)
            .await;
        assert_eq!(*pass.state(), GateState::Denied(DenialReason::NotAdmin));

        authority.grant_admin("user-1");
        gate.run(&mut pass, Some(&session("user-1", true)), None)
            .await;
        assert_eq!(*pass.state(), GateState::Verified);
        assert_eq!(pass.history()[0], GateState::Unverified);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut pass = GatePass::new();
        assert!(pass.transition(GateState::Verified).is_err());

        pass.transition(GateState::Verifying).unwrap();
        pass.transition(GateState::Verified).unwrap();

        let err = pass.transition(GateState::Verifying).unwrap_err();
        assert_eq!(
            err,
            GateError::IllegalTransition {
                from: GateState::Verified,
                to: GateState::Verifying,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_down_scope_abandons_result() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        authority.set_latency(Duration::from_secs(2));
        let gate = gate(&authority);
        let admin = session("admin-1", true);
        let (guard, scope) = RenderScope::new();

        let (outcome, _) = tokio::join!(gate.enter_scoped(Some(&admin), None, &scope), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(guard);
        });

        assert_eq!(outcome, GateOutcome::Abandoned);
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_detached_scope_never_cancels() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let scope = RenderScope::detached();

        let outcome = gate(&authority)
            .enter_scoped(Some(&session("admin-1", true)), None, &scope)
            .await;

        assert!(outcome.is_render());
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_guard_before_entry() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let (guard, scope) = RenderScope::new();
        guard.cancel();

        let outcome = gate(&authority)
            .enter_scoped(Some(&session("admin-1", true)), None, &scope)
            .await;

        assert_eq!(outcome, GateOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_remote_denial_is_audited() {
        let authority = MockAuthority::new();
        authority.grant_admin("admin-1");
        let gate = gate(&authority).with_audit(AuditTrail::new(Arc::new(authority.clone())));

        gate.enter(
            Some(&session("admin-1", true)),
            Some(&ActionRequirement::new("delete_listing")),
        )
        .await;
        gate.enter(Some(&session("user-2", false)), None).await;
        tokio::task::yield_now().await;

        let events = authority.security_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "admin_access_denied");
        assert_eq!(events[0].risk_level, RiskLevel::High);
        assert_eq!(events[0].details["action"], "delete_listing");
    }

    #[test]
    fn test_denial_messages() {
        assert_eq!(DenialReason::NotAdmin.to_string(), "Admin privileges required");
        assert_eq!(
            DenialReason::ActionRejected {
                action: "refund".to_string()
            }
            .to_string(),
            "Not authorized to perform 'refund'"
        );
    }

    proptest! {
        #[test]
        fn prop_never_renders_without_remote_confirmation(
            subject in "[a-z0-9-]{1,16}",
            claim in any::<bool>(),
            status_fails in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let authority = MockAuthority::new();
            if status_fails {
                authority.fail(Operation::AdminStatus);
            }

            let outcome = rt.block_on(gate(&authority).enter(Some(&session(&subject, claim)), None));
            prop_assert!(!outcome.is_render());
        }
    }
}
