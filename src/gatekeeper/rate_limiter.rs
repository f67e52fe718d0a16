//! Rate Limit Client
//!
//! Asks the remote rate-limit procedure for an allow/deny decision before
//! sensitive actions (login, payment, booking). Enforcement is remote; this
//! client only builds the identifier, relays the decision and computes a
//! caller-side backoff hint.
//!
//! ## Failure policy
//!
//! Fails OPEN. If the remote check cannot be completed, the action is allowed
//! with `remaining = max_requests` and the window assumed to start now. This
//! is a defense-in-depth layer, not the sole protection.
//!
//! ## Progressive backoff hint
//!
//! Consecutive denials for the same action class walk up the cooldown tiers:
//!
//! - 1st denial: 1 minute (60 seconds)
//! - 2nd denial: 5 minutes (300 seconds)
//! - 3rd denial: 1 hour (3600 seconds)
//! - 4th+ denial: 24 hours (86400 seconds)
//!
//! The hint is never shorter than the time until the window resets. Any
//! allowed decision resets the streak.

use super::audit_trail::{AuditTrail, SecurityEventKind};
use crate::authority::{unix_now, RemoteAuthority};
use crate::identity::IdentifierKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Action classes subject to rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionClass {
    /// Sign-in, sign-up, password reset
    Auth,
    /// Checkout and payout operations
    Payment,
    /// Booking requests and changes
    Booking,
    /// Everything else
    General,
}

impl ActionClass {
    pub const ALL: [ActionClass; 4] = [
        ActionClass::Auth,
        ActionClass::Payment,
        ActionClass::Booking,
        ActionClass::General,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ActionClass::Auth => "auth",
            ActionClass::Payment => "payment",
            ActionClass::Booking => "booking",
            ActionClass::General => "general",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionClass::ALL
            .into_iter()
            .find(|class| class.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown action class '{}' (expected auth, payment, booking or general)",
                    s
                )
            })
    }
}

/// Limit applied to one action class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
    /// Report a progressive backoff hint on repeated denials.
    #[serde(default)]
    pub progressive_backoff: bool,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
            progressive_backoff: false,
        }
    }

    pub fn progressive(mut self) -> Self {
        self.progressive_backoff = true;
        self
    }

    /// Default limit for an action class.
    pub fn for_class(class: ActionClass) -> Self {
        match class {
            ActionClass::Auth => Self::new(5, 900).progressive(),
            ActionClass::Payment => Self::new(10, 3600).progressive(),
            ActionClass::Booking => Self::new(20, 3600),
            ActionClass::General => Self::new(100, 60),
        }
    }
}

/// Cooldown for the n-th consecutive denial (index 0 is unused: no denial).
pub const COOLDOWN_TIERS: &[u64] = &[
    0,     // no denial yet
    60,    // 1st denial: 1 minute
    300,   // 2nd denial: 5 minutes
    3600,  // 3rd denial: 1 hour
    86400, // 4th+ denial: 24 hours
];

pub fn get_cooldown_duration(denial_streak: u32) -> u64 {
    let index = (denial_streak as usize).min(COOLDOWN_TIERS.len() - 1);
    COOLDOWN_TIERS[index]
}

/// Decision handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix seconds at which the window resets.
    pub reset_time: u64,
    /// Progressive backoff hint for denied decisions.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Conservative default quota used when the remote check fails.
    pub fn fail_open(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            allowed: true,
            remaining: config.max_requests,
            reset_time: now.saturating_add(config.window_secs),
            retry_after: None,
        }
    }
}

/// Rate limit errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Too many {action} attempts, try again in {}", format_wait(.retry_after, .reset_time))]
    Limited {
        action: ActionClass,
        retry_after: Option<Duration>,
        reset_time: u64,
    },
}

fn format_wait(retry_after: &Option<Duration>, reset_time: &u64) -> String {
    let wait = retry_after
        .unwrap_or_else(|| Duration::from_secs(reset_time.saturating_sub(unix_now())));
    format_duration(wait)
}

/// Rate limit client.
///
/// Explicitly constructed and passed to call sites; holds the caller
/// identity used to build identifiers and the per-class denial streaks.
pub struct RateLimitClient {
    authority: Arc<dyn RemoteAuthority>,
    key: IdentifierKey,
    /// Stand-in subject for signed-out callers.
    installation_id: String,
    subject: RwLock<Option<String>>,
    denial_streaks: Mutex<HashMap<ActionClass, u32>>,
    audit: Option<AuditTrail>,
    clock: fn() -> u64,
}

impl RateLimitClient {
    pub fn new(
        authority: Arc<dyn RemoteAuthority>,
        key: IdentifierKey,
        installation_id: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            key,
            installation_id: installation_id.into(),
            subject: RwLock::new(None),
            denial_streaks: Mutex::new(HashMap::new()),
            audit: None,
            clock: unix_now,
        }
    }

    /// Replace the wall clock used for fail-open quotas and backoff hints.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Log `rate_limit_exceeded` events when `guard` refuses an action.
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Set the signed-in subject (None after sign-out).
    pub async fn set_subject(&self, subject_id: Option<String>) {
        *self.subject.write().await = subject_id;
    }

    /// Identifier sent to the remote store for `action`.
    pub async fn identifier(&self, action: ActionClass) -> String {
        let subject = self.subject.read().await;
        let subject = subject.as_deref().unwrap_or(&self.installation_id);
        self.key.identifier(action.name(), subject)
    }

    /// Ask the remote service whether `action` may proceed.
    pub async fn check_limit(
        &self,
        action: ActionClass,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let identifier = self.identifier(action).await;

        let remote = match self
            .authority
            .check_rate_limit(&identifier, config.max_requests, config.window_secs)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(action = %action, error = %e, "rate limit check failed, allowing request");
                return RateLimitDecision::fail_open(config, (self.clock)());
            }
        };

        let retry_after = self
            .track_denials(action, remote.allowed, remote.reset_time, config)
            .await;

        debug!(
            action = %action,
            allowed = remote.allowed,
            remaining = remote.remaining,
            "rate limit decision"
        );

        RateLimitDecision {
            allowed: remote.allowed,
            remaining: remote.remaining,
            reset_time: remote.reset_time,
            retry_after,
        }
    }

    /// Run `operation` only if `action` is currently allowed.
    pub async fn guard<F, T>(
        &self,
        action: ActionClass,
        config: &RateLimitConfig,
        operation: F,
    ) -> Result<T, RateLimitError>
    where
        F: Future<Output = T>,
    {
        let decision = self.check_limit(action, config).await;
        if !decision.allowed {
            if let Some(audit) = &self.audit {
                let mut event = SecurityEventKind::RateLimitExceeded
                    .event()
                    .with_details(serde_json::json!({ "action_class": action.name() }));
                if let Some(subject) = self.subject.read().await.clone() {
                    event = event.with_subject(subject);
                }
                audit.emit_security_event_detached(event);
            }
            return Err(RateLimitError::Limited {
                action,
                retry_after: decision.retry_after,
                reset_time: decision.reset_time,
            });
        }
        Ok(operation.await)
    }

    /// Update the denial streak and compute the backoff hint.
    async fn track_denials(
        &self,
        action: ActionClass,
        allowed: bool,
        reset_time: u64,
        config: &RateLimitConfig,
    ) -> Option<Duration> {
        let mut streaks = self.denial_streaks.lock().await;
        if allowed {
            streaks.remove(&action);
            return None;
        }

        let streak = streaks.entry(action).or_insert(0);
        *streak = streak.saturating_add(1);

        if !config.progressive_backoff {
            return None;
        }

        let until_reset = reset_time.saturating_sub((self.clock)());
        Some(Duration::from_secs(
            get_cooldown_duration(*streak).max(until_reset),
        ))
    }

    /// Consecutive denials recorded for `action`.
    pub async fn denial_streak(&self, action: ActionClass) -> u32 {
        self.denial_streaks
            .lock()
            .await
            .get(&action)
            .copied()
            .unwrap_or(0)
    }
}

/// Format a duration as a human-readable string for user-facing messages.
///
/// Examples: "1 second", "2 minutes", "1 hour", "1 day".
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs >= 86400 {
        let days = secs / 86400;
        format!("{} day{}", days, if days == 1 { "" } else { "s" })
    } else if secs >= 3600 {
        let hours = secs / 3600;
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if secs >= 60 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        format!("{} second{}", secs, if secs == 1 { "" } else { "s" })
    }
}
