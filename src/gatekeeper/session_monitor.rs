//! Session expiry monitoring.
//!
//! Polls the cached session on a fixed interval:
//! - No session: nothing to do
//! - `0 < remaining <= threshold`: warn once per threshold crossing, then
//!   keep a live countdown going
//! - `remaining <= 0`: sign out immediately, no retry, no grace period
//!
//! Each tick is single-flight: a tick that starts while the previous one is
//! still waiting on the accessor is skipped, so sign-out and refresh are
//! never issued twice. The polling task lives exactly as long as its
//! `MonitorHandle`.

use super::audit_trail::{AuditTrail, SecurityEventKind};
use crate::authority::{unix_now, AuthorityError, Session, SessionAccessor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Capacity of the event channel. Events beyond it are dropped, never waited on.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub warning_threshold: Duration,
    /// Refresh ahead of expiry when the session can refresh and at most this
    /// much time remains. Off by default.
    pub auto_refresh_margin: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            auto_refresh_margin: None,
        }
    }
}

/// Where a session stands relative to the warning threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPhase {
    Healthy,
    Expiring(Duration),
    Expired,
}

/// Classify `remaining_secs` (signed) against `threshold`.
pub fn evaluate(remaining_secs: i64, threshold: Duration) -> ExpiryPhase {
    if remaining_secs <= 0 {
        return ExpiryPhase::Expired;
    }
    let remaining = remaining_secs.unsigned_abs();
    if remaining <= threshold.as_secs() {
        ExpiryPhase::Expiring(Duration::from_secs(remaining))
    } else {
        ExpiryPhase::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    Expired,
    UserRequested,
}

/// Events surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session entered the warning window. Offer "sign out" and "extend".
    WarningRaised { remaining: Duration },
    /// Still inside the warning window.
    Countdown { remaining: Duration },
    Refreshed { expires_at: u64 },
    SignedOut { reason: SignOutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoSession,
    Healthy,
    Expiring { remaining: Duration },
    SignedOut,
    /// A previous tick was still in flight.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("No active session")]
    NoSession,

    #[error("Session refresh failed: {0}")]
    RefreshFailed(#[from] AuthorityError),
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Session monitor.
pub struct SessionMonitor {
    accessor: Arc<dyn SessionAccessor>,
    config: MonitorConfig,
    events: mpsc::Sender<SessionEvent>,
    /// Set once the warning for the current threshold crossing was raised.
    warned: AtomicBool,
    in_flight: AtomicBool,
    audit: Option<AuditTrail>,
}

impl SessionMonitor {
    /// Create a monitor and the receiving end of its event stream.
    pub fn new(
        accessor: Arc<dyn SessionAccessor>,
        config: MonitorConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let monitor = Self {
            accessor,
            config,
            events,
            warned: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            audit: None,
        };
        (monitor, receiver)
    }

    /// Log `session_expired` events on forced sign-out.
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one poll of the cached session.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.in_flight) else {
            debug!("previous session check still in flight, skipping tick");
            return TickOutcome::Skipped;
        };

        let Some(mut session) = self.accessor.current_session().await else {
            self.warned.store(false, Ordering::Release);
            return TickOutcome::NoSession;
        };

        if let Some(refreshed) = self.maybe_auto_refresh(&session).await {
            session = refreshed;
        }

        match evaluate(session.remaining_secs(unix_now()), self.config.warning_threshold) {
            ExpiryPhase::Expired => {
                self.force_sign_out(Some(&session), SignOutReason::Expired)
                    .await;
                TickOutcome::SignedOut
            }
            ExpiryPhase::Expiring(remaining) => {
                if self.warned.swap(true, Ordering::AcqRel) {
                    self.emit(SessionEvent::Countdown { remaining });
                } else {
                    info!(
                        subject = %session.subject_id,
                        remaining_secs = remaining.as_secs(),
                        "session about to expire"
                    );
                    self.emit(SessionEvent::WarningRaised { remaining });
                }
                TickOutcome::Expiring { remaining }
            }
            ExpiryPhase::Healthy => {
                self.warned.store(false, Ordering::Release);
                TickOutcome::Healthy
            }
        }
    }

    async fn maybe_auto_refresh(&self, session: &Session) -> Option<Session> {
        let margin = self.config.auto_refresh_margin?;
        let remaining = session.remaining_secs(unix_now());
        if !session.can_refresh()
            || remaining <= 0
            || remaining.unsigned_abs() > margin.as_secs()
        {
            return None;
        }

        match self.accessor.refresh_session().await {
            Ok(refreshed) => {
                debug!(subject = %refreshed.subject_id, "session auto-refreshed");
                self.emit(SessionEvent::Refreshed {
                    expires_at: refreshed.expires_at,
                });
                Some(refreshed)
            }
            Err(e) => {
                warn!(error = %e, "session auto-refresh failed");
                None
            }
        }
    }

    /// User chose "sign out" from the warning.
    pub async fn sign_out_now(&self) {
        let session = self.accessor.current_session().await;
        self.force_sign_out(session.as_ref(), SignOutReason::UserRequested)
            .await;
    }

    /// User chose "extend": force re-authentication against the authority.
    pub async fn extend(&self) -> Result<Session, MonitorError> {
        if self.accessor.current_session().await.is_none() {
            return Err(MonitorError::NoSession);
        }
        let session = self.accessor.refresh_session().await?;
        self.warned.store(false, Ordering::Release);
        self.emit(SessionEvent::Refreshed {
            expires_at: session.expires_at,
        });
        Ok(session)
    }

    /// Sign out once. A remote failure is logged, never retried: the local
    /// session is gone either way.
    async fn force_sign_out(&self, session: Option<&Session>, reason: SignOutReason) {
        if let Err(e) = self.accessor.sign_out().await {
            warn!(error = %e, "remote sign-out failed, local session cleared");
        }
        self.warned.store(false, Ordering::Release);
        info!(?reason, "signed out");

        if reason == SignOutReason::Expired {
            if let Some(audit) = &self.audit {
                let mut event = SecurityEventKind::SessionExpired.event();
                if let Some(session) = session {
                    event = event.with_subject(session.subject_id.clone());
                }
                audit.emit_security_event_detached(event);
            }
        }

        self.emit(SessionEvent::SignedOut { reason });
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "session event buffer full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("session event receiver dropped");
            }
        }
    }

    /// Start polling. Stops after a sign-out, on `MonitorHandle::stop`, or
    /// when the handle is dropped.
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if self.tick().await == TickOutcome::SignedOut {
                            break;
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }

            debug!("session monitor stopped");
        });

        MonitorHandle { stop, task }
    }
}

/// Owns the polling task. Dropping it ends the task at its next wake-up.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the polling task to end.
    pub async fn join(self) {
        let MonitorHandle { stop, task } = self;
        if let Err(e) = task.await {
            warn!(error = %e, "session monitor task failed");
        }
        drop(stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::mock::{MockAuthority, MockSessionAccessor, Operation};

    fn session_expiring_in(secs: i64) -> Session {
        let now = unix_now() as i64;
        Session {
            subject_id: "user-1".to_string(),
            email: None,
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            issued_at: (now - 3600) as u64,
            expires_at: (now + secs) as u64,
            is_admin: false,
        }
    }

    fn monitor(
        accessor: &MockSessionAccessor,
        config: MonitorConfig,
    ) -> (SessionMonitor, mpsc::Receiver<SessionEvent>) {
        SessionMonitor::new(Arc::new(accessor.clone()), config)
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_evaluate_boundaries() {
        let threshold = Duration::from_secs(300);
        assert_eq!(evaluate(-5, threshold), ExpiryPhase::Expired);
        assert_eq!(evaluate(0, threshold), ExpiryPhase::Expired);
        assert_eq!(
            evaluate(1, threshold),
            ExpiryPhase::Expiring(Duration::from_secs(1))
        );
        assert_eq!(
            evaluate(300, threshold),
            ExpiryPhase::Expiring(Duration::from_secs(300))
        );
        assert_eq!(evaluate(301, threshold), ExpiryPhase::Healthy);
        assert_eq!(evaluate(i64::MAX, threshold), ExpiryPhase::Healthy);
    }

    #[tokio::test]
    async fn test_no_session_takes_no_action() {
        let accessor = MockSessionAccessor::new(None);
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        assert_eq!(monitor.tick().await, TickOutcome::NoSession);
        assert_eq!(accessor.sign_out_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_signs_out_immediately() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(-10)));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        assert_eq!(monitor.tick().await, TickOutcome::SignedOut);
        assert_eq!(accessor.sign_out_count(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::SignedOut {
                reason: SignOutReason::Expired
            }]
        );
    }

    #[tokio::test]
    async fn test_sign_out_failure_is_not_retried() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(0)));
        accessor.fail_sign_out(true);
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        assert_eq!(monitor.tick().await, TickOutcome::SignedOut);
        assert_eq!(monitor.tick().await, TickOutcome::NoSession);
        assert_eq!(accessor.sign_out_count(), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_warning_raised_once_per_crossing() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(200)));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        for _ in 0..3 {
            assert!(matches!(
                monitor.tick().await,
                TickOutcome::Expiring { .. }
            ));
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SessionEvent::WarningRaised { .. }));
        assert!(matches!(events[1], SessionEvent::Countdown { .. }));
        assert!(matches!(events[2], SessionEvent::Countdown { .. }));
        assert_eq!(accessor.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_warning_rearms_after_extend() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(120)));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        monitor.tick().await;
        let extended = monitor.extend().await.unwrap();
        assert!(extended.expires_at > unix_now() + 300);
        assert_eq!(monitor.tick().await, TickOutcome::Healthy);

        accessor.set_session(Some(session_expiring_in(60)));
        monitor.tick().await;

        let warnings = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::WarningRaised { .. }))
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_extend_without_session_fails() {
        let accessor = MockSessionAccessor::new(None);
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());
        assert!(matches!(monitor.extend().await, Err(MonitorError::NoSession)));
        assert_eq!(accessor.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_extend_surfaces_refresh_failure() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(120)));
        accessor.fail_refresh(true);
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());
        assert!(matches!(
            monitor.extend().await,
            Err(MonitorError::RefreshFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_out_now() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(200)));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        monitor.sign_out_now().await;

        assert_eq!(accessor.sign_out_count(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::SignedOut {
                reason: SignOutReason::UserRequested
            }]
        );
    }

    #[tokio::test]
    async fn test_auto_refresh_inside_margin() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(400)));
        let config = MonitorConfig {
            auto_refresh_margin: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        let (monitor, mut rx) = monitor(&accessor, config);

        assert_eq!(monitor.tick().await, TickOutcome::Healthy);
        assert_eq!(accessor.refresh_count(), 1);
        assert!(matches!(
            drain(&mut rx)[..],
            [SessionEvent::Refreshed { .. }]
        ));
    }

    #[tokio::test]
    async fn test_corrupt_far_future_expiry_stays_healthy() {
        let mut session = session_expiring_in(3600);
        session.expires_at = u64::MAX;
        let accessor = MockSessionAccessor::new(Some(session));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        assert_eq!(monitor.tick().await, TickOutcome::Healthy);
        assert_eq!(accessor.sign_out_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_auto_refresh_failure_still_warns() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(100)));
        accessor.fail_refresh(true);
        let config = MonitorConfig {
            auto_refresh_margin: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        let (monitor, mut rx) = monitor(&accessor, config);

        assert!(matches!(
            monitor.tick().await,
            TickOutcome::Expiring { .. }
        ));
        assert!(matches!(
            drain(&mut rx)[..],
            [SessionEvent::WarningRaised { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tick_is_skipped() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(3600)));
        accessor.set_latency(Duration::from_secs(5));
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());

        let (first, second) = tokio::join!(monitor.tick(), monitor.tick());

        assert_eq!(first, TickOutcome::Healthy);
        assert_eq!(second, TickOutcome::Skipped);
        // The guard is released afterwards.
        assert_eq!(monitor.tick().await, TickOutcome::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_signs_out_within_one_interval() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(-1)));
        let (monitor, mut rx) = monitor(&accessor, MonitorConfig::default());

        let handle = Arc::new(monitor).spawn();
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;

        assert_eq!(accessor.sign_out_count(), 1);
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::SignedOut {
                reason: SignOutReason::Expired
            })
        );
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_polling() {
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(3600)));
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());

        let handle = Arc::new(monitor).spawn();
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.stop();
        handle.join().await;

        // Session was never touched.
        assert_eq!(accessor.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_expiry_is_audited() {
        let authority = MockAuthority::new();
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(-30)));
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());
        let monitor = monitor.with_audit(AuditTrail::new(Arc::new(authority.clone())));

        monitor.tick().await;
        tokio::task::yield_now().await;

        let events = authority.security_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "session_expired");
        assert_eq!(events[0].subject_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_block_sign_out() {
        let authority = MockAuthority::new();
        authority.fail(Operation::SecurityEvent);
        let accessor = MockSessionAccessor::new(Some(session_expiring_in(-30)));
        let (monitor, _rx) = monitor(&accessor, MonitorConfig::default());
        let monitor = monitor.with_audit(AuditTrail::new(Arc::new(authority.clone())));

        assert_eq!(monitor.tick().await, TickOutcome::SignedOut);
        assert_eq!(accessor.sign_out_count(), 1);
    }
}
