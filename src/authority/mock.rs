//! Mock authority and session accessor for testing.
//!
//! `MockAuthority` records every remote call in order, can be told to fail or
//! deny specific operations, and implements a fixed-window rate limiter keyed
//! by identifier and window start with lazy purge of expired windows.

use super::traits::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remote operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AdminStatus,
    AdminAction,
    RateLimit,
    SecurityEvent,
    AdminActionLog,
}

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityCall {
    AdminStatus {
        subject_id: String,
    },
    AdminAction {
        subject_id: String,
        action: String,
        target: Option<String>,
    },
    RateLimit {
        identifier: String,
        max_requests: u32,
        window_secs: u64,
    },
    SecurityEvent {
        event_type: String,
    },
    AdminActionLog {
        action: String,
    },
}

impl AuthorityCall {
    /// Admin status and scoped action checks.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            AuthorityCall::AdminStatus { .. } | AuthorityCall::AdminAction { .. }
        )
    }
}

#[derive(Default)]
struct MockState {
    admins: HashSet<String>,
    granted_actions: HashSet<(String, String)>,
    failing: HashSet<Operation>,
    calls: Vec<AuthorityCall>,
    /// (identifier, window start) -> (window length, count)
    windows: HashMap<(String, u64), (u64, u32)>,
    security_events: Vec<SecurityEvent>,
    admin_actions: Vec<AdminActionRecord>,
    now: Option<u64>,
    latency: Option<Duration>,
}

/// Mock remote authority for testing.
#[derive(Clone, Default)]
pub struct MockAuthority {
    state: Arc<Mutex<MockState>>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a subject as an admin on the remote side.
    pub fn grant_admin(&self, subject_id: &str) {
        self.state.lock().unwrap().admins.insert(subject_id.to_string());
    }

    /// Allow `subject_id` to perform `action` on any target.
    pub fn grant_action(&self, subject_id: &str, action: &str) {
        self.state
            .lock()
            .unwrap()
            .granted_actions
            .insert((subject_id.to_string(), action.to_string()));
    }

    /// Make an operation return a network error.
    pub fn fail(&self, operation: Operation) {
        self.state.lock().unwrap().failing.insert(operation);
    }

    pub fn recover(&self, operation: Operation) {
        self.state.lock().unwrap().failing.remove(&operation);
    }

    /// Pin the clock used for rate-limit windows (unix seconds).
    pub fn set_now(&self, now: u64) {
        self.state.lock().unwrap().now = Some(now);
    }

    pub fn advance(&self, secs: u64) {
        let mut state = self.state.lock().unwrap();
        let now = state.now.unwrap_or_else(unix_now);
        state.now = Some(now + secs);
    }

    /// Delay every response, so callers can observe in-flight behavior.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    pub fn calls(&self) -> Vec<AuthorityCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn verification_calls(&self) -> Vec<AuthorityCall> {
        self.calls()
            .into_iter()
            .filter(AuthorityCall::is_verification)
            .collect()
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.state.lock().unwrap().security_events.clone()
    }

    pub fn admin_actions(&self) -> Vec<AdminActionRecord> {
        self.state.lock().unwrap().admin_actions.clone()
    }

    /// Number of live rate-limit windows held by the store.
    pub fn window_count(&self) -> usize {
        self.state.lock().unwrap().windows.len()
    }

    async fn delay(&self) {
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(&self, call: AuthorityCall, operation: Operation) -> AuthorityResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing.contains(&operation) {
            return Err(AuthorityError::Network("mock: connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAuthority for MockAuthority {
    async fn validate_admin_status(&self, subject_id: &str) -> AuthorityResult<bool> {
        self.delay().await;
        self.record(
            AuthorityCall::AdminStatus {
                subject_id: subject_id.to_string(),
            },
            Operation::AdminStatus,
        )?;
        Ok(self.state.lock().unwrap().admins.contains(subject_id))
    }

    async fn validate_admin_action(
        &self,
        subject_id: &str,
        action: &str,
        target: Option<&str>,
    ) -> AuthorityResult<bool> {
        self.delay().await;
        self.record(
            AuthorityCall::AdminAction {
                subject_id: subject_id.to_string(),
                action: action.to_string(),
                target: target.map(str::to_string),
            },
            Operation::AdminAction,
        )?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .granted_actions
            .contains(&(subject_id.to_string(), action.to_string())))
    }

    async fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> AuthorityResult<RemoteDecision> {
        self.delay().await;
        self.record(
            AuthorityCall::RateLimit {
                identifier: identifier.to_string(),
                max_requests,
                window_secs,
            },
            Operation::RateLimit,
        )?;

        let mut state = self.state.lock().unwrap();
        let now = state.now.unwrap_or_else(unix_now);
        let window = window_secs.max(1);
        let window_start = now - now % window;
        let reset_time = window_start.saturating_add(window);

        // Lazy purge: drop every window that has already closed.
        state
            .windows
            .retain(|(_, start), (length, _)| start.saturating_add(*length) > now);

        let (_, count) = state
            .windows
            .entry((identifier.to_string(), window_start))
            .or_insert((window, 0));

        if *count >= max_requests {
            return Ok(RemoteDecision {
                allowed: false,
                remaining: 0,
                reset_time,
            });
        }

        *count += 1;
        Ok(RemoteDecision {
            allowed: true,
            remaining: max_requests - *count,
            reset_time,
        })
    }

    async fn log_security_event(&self, event: &SecurityEvent) -> AuthorityResult<()> {
        self.delay().await;
        self.record(
            AuthorityCall::SecurityEvent {
                event_type: event.event_type.clone(),
            },
            Operation::SecurityEvent,
        )?;
        self.state
            .lock()
            .unwrap()
            .security_events
            .push(event.clone());
        Ok(())
    }

    async fn log_admin_action(&self, record: &AdminActionRecord) -> AuthorityResult<()> {
        self.delay().await;
        self.record(
            AuthorityCall::AdminActionLog {
                action: record.action.clone(),
            },
            Operation::AdminActionLog,
        )?;
        self.state.lock().unwrap().admin_actions.push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    sign_outs: u32,
    refreshes: u32,
    fail_refresh: bool,
    fail_sign_out: bool,
    refresh_lifetime: Option<u64>,
    latency: Option<Duration>,
}

/// Mock session accessor for testing.
#[derive(Clone, Default)]
pub struct MockSessionAccessor {
    state: Arc<Mutex<SessionState>>,
}

impl MockSessionAccessor {
    pub fn new(session: Option<Session>) -> Self {
        let accessor = Self::default();
        accessor.state.lock().unwrap().session = session;
        accessor
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.state.lock().unwrap().session = session;
    }

    pub fn sign_out_count(&self) -> u32 {
        self.state.lock().unwrap().sign_outs
    }

    pub fn refresh_count(&self) -> u32 {
        self.state.lock().unwrap().refreshes
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.state.lock().unwrap().fail_refresh = fail;
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.state.lock().unwrap().fail_sign_out = fail;
    }

    /// Lifetime in seconds granted by a successful refresh (default one hour).
    pub fn set_refresh_lifetime(&self, secs: u64) {
        self.state.lock().unwrap().refresh_lifetime = Some(secs);
    }

    /// Delay reads of the current session.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }
}

#[async_trait]
impl SessionAccessor for MockSessionAccessor {
    async fn current_session(&self) -> Option<Session> {
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().unwrap().session.clone()
    }

    async fn sign_out(&self) -> AuthorityResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sign_outs += 1;
        state.session = None;
        if state.fail_sign_out {
            return Err(AuthorityError::Network("mock: logout unreachable".to_string()));
        }
        Ok(())
    }

    async fn refresh_session(&self) -> AuthorityResult<Session> {
        let mut state = self.state.lock().unwrap();
        state.refreshes += 1;
        if state.fail_refresh {
            return Err(AuthorityError::Network("mock: refresh unreachable".to_string()));
        }
        let lifetime = state.refresh_lifetime.unwrap_or(3600);
        let current = state.session.clone().ok_or(AuthorityError::Unauthorized)?;
        let now = unix_now();
        let refreshed = Session {
            issued_at: now,
            expires_at: now + lifetime,
            ..current
        };
        state.session = Some(refreshed.clone());
        Ok(refreshed)
    }
}
