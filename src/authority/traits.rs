//! Trait abstractions for the remote authority and the session accessor.
//!
//! Every decision in this crate is made by the BaaS: admin status, scoped
//! action grants, rate-limit windows. The client only holds a cached copy of
//! the session. These traits are the seams where the HTTP implementation
//! and the test mocks plug in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Cached authentication session.
///
/// Owned by the remote authentication authority; the client treats this as a
/// read-only snapshot that is replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub issued_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
    /// Admin claim from the cached token. A pre-filter only, never trusted.
    #[serde(default)]
    pub is_admin: bool,
}

impl Session {
    /// Whether the session carries a refresh token.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Signed seconds until expiry; zero or negative once expired.
    pub fn remaining_secs(&self, now: u64) -> i64 {
        let expires_at = i64::try_from(self.expires_at).unwrap_or(i64::MAX);
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        expires_at.saturating_sub(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.remaining_secs(now) <= 0
    }
}

// Tokens never reach logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("subject_id", &self.subject_id)
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

/// Decision returned by the remote rate-limit procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix seconds at which the current window resets.
    pub reset_time: u64,
}

/// Severity attached to a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security-relevant event appended to the remote audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub subject_id: Option<String>,
    pub event_type: String,
    pub details: serde_json::Value,
    pub risk_level: RiskLevel,
}

impl SecurityEvent {
    pub fn new(event_type: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            subject_id: None,
            event_type: event_type.into(),
            details: serde_json::Value::Object(Default::default()),
            risk_level,
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Privileged action performed by an admin, with optional before/after values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminActionRecord {
    pub admin_id: String,
    pub action: String,
    pub table: Option<String>,
    pub record_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

impl AdminActionRecord {
    pub fn new(admin_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            admin_id: admin_id.into(),
            action: action.into(),
            table: None,
            record_id: None,
            old_values: None,
            new_values: None,
        }
    }

    pub fn on_record(mut self, table: impl Into<String>, record_id: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_change(
        mut self,
        old_values: Option<serde_json::Value>,
        new_values: Option<serde_json::Value>,
    ) -> Self {
        self.old_values = old_values;
        self.new_values = new_values;
        self
    }
}

/// Result type for remote authority operations.
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Remote authority errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("{0}")]
    Other(String),
}

impl AuthorityError {
    /// Transient failures are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Remote procedures exposed by the BaaS.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Confirm the subject currently holds admin privilege.
    async fn validate_admin_status(&self, subject_id: &str) -> AuthorityResult<bool>;

    /// Confirm the subject may perform `action`, optionally against `target`.
    async fn validate_admin_action(
        &self,
        subject_id: &str,
        action: &str,
        target: Option<&str>,
    ) -> AuthorityResult<bool>;

    /// Count one request against `identifier`'s current window.
    async fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> AuthorityResult<RemoteDecision>;

    async fn log_security_event(&self, event: &SecurityEvent) -> AuthorityResult<()>;

    async fn log_admin_action(&self, record: &AdminActionRecord) -> AuthorityResult<()>;
}

/// Access to the locally cached session.
#[async_trait]
pub trait SessionAccessor: Send + Sync {
    async fn current_session(&self) -> Option<Session>;

    /// Sign out. Local state is cleared even when the remote call fails.
    async fn sign_out(&self) -> AuthorityResult<()>;

    /// Force a refresh against the authority and return the new session.
    async fn refresh_session(&self) -> AuthorityResult<Session>;
}
