//! HTTP implementations of the authority traits.
//!
//! Remote procedures are invoked as JSON POSTs to `{base_url}/rest/v1/rpc/{fn}`;
//! the session is refreshed and revoked through `{base_url}/auth/v1/*`. Every
//! request carries the project's anon key in the `apikey` header and a bearer
//! token: the session's access token when one is cached, the anon key otherwise.

use super::retry::retry_with_backoff;
use super::traits::*;
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const RPC_VALIDATE_ADMIN_SESSION: &str = "validate_admin_session";
const RPC_VALIDATE_ADMIN_ACTION: &str = "validate_admin_action";
const RPC_CHECK_RATE_LIMIT: &str = "check_rate_limit";
const RPC_LOG_SECURITY_EVENT: &str = "log_security_event";
const RPC_LOG_ADMIN_ACTION: &str = "log_admin_action";

/// Lifetime assumed when the token endpoint omits both `expires_at` and `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpAuthorityConfig {
    /// Project URL, e.g. `https://abc.example.co`
    pub base_url: String,
    /// Public anon key sent as `apikey`
    pub anon_key: String,
    /// Whole-request transport timeout in seconds
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpAuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("rentguard/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpAuthorityConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Create a configured HTTP client
pub fn create_client(config: &HttpAuthorityConfig) -> AuthorityResult<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(&config.user_agent)
        .build()
        .map_err(|e| AuthorityError::Other(format!("Failed to create HTTP client: {}", e)))
}

impl From<reqwest::Error> for AuthorityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthorityError::Decode(err.to_string())
        } else {
            AuthorityError::Network(err.to_string())
        }
    }
}

/// Map a non-success response to an error, otherwise hand it back.
async fn check_status(response: Response) -> AuthorityResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(AuthorityError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthorityError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<R: DeserializeOwned>(response: Response) -> AuthorityResult<R> {
    check_status(response)
        .await?
        .json::<R>()
        .await
        .map_err(|e| AuthorityError::Decode(e.to_string()))
}

/// Table-returning procedures answer with a one-row array; scalar ones with the value.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_first(self) -> Option<T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.into_iter().next(),
        }
    }
}

#[derive(Serialize)]
struct AdminStatusArgs<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct AdminActionArgs<'a> {
    user_id: &'a str,
    action_name: &'a str,
    target_user_id: Option<&'a str>,
}

#[derive(Serialize)]
struct RateLimitArgs<'a> {
    identifier: &'a str,
    max_requests: u32,
    window_seconds: u64,
}

#[derive(Serialize)]
struct SecurityEventArgs<'a> {
    user_id: Option<&'a str>,
    event_type: &'a str,
    details: &'a serde_json::Value,
    risk_level: RiskLevel,
}

#[derive(Serialize)]
struct AdminActionLogArgs<'a> {
    admin_id: &'a str,
    action: &'a str,
    table_name: Option<&'a str>,
    record_id: Option<&'a str>,
    old_values: Option<&'a serde_json::Value>,
    new_values: Option<&'a serde_json::Value>,
}

/// Remote authority reached over the BaaS RPC endpoint.
pub struct HttpAuthority {
    client: Client,
    config: HttpAuthorityConfig,
    session: Option<Arc<dyn SessionAccessor>>,
}

impl HttpAuthority {
    pub fn new(config: HttpAuthorityConfig) -> AuthorityResult<Self> {
        Ok(Self {
            client: create_client(&config)?,
            config,
            session: None,
        })
    }

    /// Authenticate RPCs as the cached session's subject.
    pub fn with_session(mut self, session: Arc<dyn SessionAccessor>) -> Self {
        self.session = Some(session);
        self
    }

    async fn bearer(&self) -> String {
        if let Some(accessor) = &self.session {
            if let Some(session) = accessor.current_session().await {
                return session.access_token;
            }
        }
        self.config.anon_key.clone()
    }

    async fn post_rpc<B: Serialize + ?Sized>(
        &self,
        function: &str,
        body: &B,
    ) -> AuthorityResult<Response> {
        debug!(function, "calling remote procedure");
        let bearer = self.bearer().await;
        let request = self
            .client
            .post(self.config.url(&format!("/rest/v1/rpc/{}", function)))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(bearer)
            .json(body);
        let response = request.send().await?;
        check_status(response).await
    }

    async fn rpc<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        function: &str,
        body: &B,
    ) -> AuthorityResult<R> {
        let response = self.post_rpc(function, body).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| AuthorityError::Decode(e.to_string()))
    }

    async fn rpc_void<B: Serialize + ?Sized>(&self, function: &str, body: &B) -> AuthorityResult<()> {
        self.post_rpc(function, body).await.map(|_| ())
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn validate_admin_status(&self, subject_id: &str) -> AuthorityResult<bool> {
        self.rpc(
            RPC_VALIDATE_ADMIN_SESSION,
            &AdminStatusArgs {
                user_id: subject_id,
            },
        )
        .await
    }

    async fn validate_admin_action(
        &self,
        subject_id: &str,
        action: &str,
        target: Option<&str>,
    ) -> AuthorityResult<bool> {
        self.rpc(
            RPC_VALIDATE_ADMIN_ACTION,
            &AdminActionArgs {
                user_id: subject_id,
                action_name: action,
                target_user_id: target,
            },
        )
        .await
    }

    async fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> AuthorityResult<RemoteDecision> {
        let decision: OneOrMany<RemoteDecision> = self
            .rpc(
                RPC_CHECK_RATE_LIMIT,
                &RateLimitArgs {
                    identifier,
                    max_requests,
                    window_seconds: window_secs,
                },
            )
            .await?;
        decision
            .into_first()
            .ok_or_else(|| AuthorityError::Decode("empty rate limit response".to_string()))
    }

    async fn log_security_event(&self, event: &SecurityEvent) -> AuthorityResult<()> {
        self.rpc_void(
            RPC_LOG_SECURITY_EVENT,
            &SecurityEventArgs {
                user_id: event.subject_id.as_deref(),
                event_type: &event.event_type,
                details: &event.details,
                risk_level: event.risk_level,
            },
        )
        .await
    }

    async fn log_admin_action(&self, record: &AdminActionRecord) -> AuthorityResult<()> {
        self.rpc_void(
            RPC_LOG_ADMIN_ACTION,
            &AdminActionLogArgs {
                admin_id: &record.admin_id,
                action: &record.action,
                table_name: record.table.as_deref(),
                record_id: record.record_id.as_deref(),
                old_values: record.old_values.as_ref(),
                new_values: record.new_values.as_ref(),
            },
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    app_metadata: serde_json::Value,
}

/// Admin claim as carried in `app_metadata`.
fn admin_claim(app_metadata: &serde_json::Value) -> bool {
    app_metadata
        .get("is_admin")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
        || app_metadata.get("role").and_then(serde_json::Value::as_str) == Some("admin")
}

/// Cached session backed by the BaaS auth endpoints.
///
/// The cache is optionally mirrored to a JSON file so a CLI invocation can
/// pick up the session a previous login left behind.
pub struct HttpSessionAccessor {
    client: Client,
    config: HttpAuthorityConfig,
    cache: RwLock<Option<Session>>,
    cache_path: Option<PathBuf>,
}

impl HttpSessionAccessor {
    pub fn new(config: HttpAuthorityConfig, session: Option<Session>) -> AuthorityResult<Self> {
        Ok(Self {
            client: create_client(&config)?,
            config,
            cache: RwLock::new(session),
            cache_path: None,
        })
    }

    /// Load the cached session from `cache_path` (if the file exists) and
    /// keep the file in sync from then on.
    pub fn load(config: HttpAuthorityConfig, cache_path: &Path) -> AuthorityResult<Self> {
        let session = if cache_path.exists() {
            let contents = std::fs::read_to_string(cache_path).map_err(|e| {
                AuthorityError::Other(format!(
                    "Failed to read session cache '{}': {}",
                    cache_path.display(),
                    e
                ))
            })?;
            Some(
                serde_json::from_str::<Session>(&contents)
                    .map_err(|e| AuthorityError::Decode(e.to_string()))?,
            )
        } else {
            None
        };

        let mut accessor = Self::new(config, session)?;
        accessor.cache_path = Some(cache_path.to_path_buf());
        Ok(accessor)
    }

    /// Replace the cached session (e.g. after login).
    pub async fn store(&self, session: Session) {
        self.persist(Some(&session)).await;
        *self.cache.write().await = Some(session);
    }

    async fn persist(&self, session: Option<&Session>) {
        let Some(path) = &self.cache_path else {
            return;
        };

        let result = match session {
            Some(session) => match serde_json::to_vec_pretty(session) {
                Ok(bytes) => tokio::fs::write(path, bytes).await,
                Err(e) => Err(std::io::Error::other(e)),
            },
            None if path.exists() => tokio::fs::remove_file(path).await,
            None => Ok(()),
        };

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to update session cache");
        }
    }

    fn with_apikey(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("apikey", &self.config.anon_key)
    }

    async fn request_refresh(&self, refresh_token: &str) -> AuthorityResult<TokenResponse> {
        let request = self
            .client
            .post(self.config.url("/auth/v1/token?grant_type=refresh_token"))
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let response = self.with_apikey(request).send().await?;
        read_json(response).await
    }
}

#[async_trait]
impl SessionAccessor for HttpSessionAccessor {
    async fn current_session(&self) -> Option<Session> {
        self.cache.read().await.clone()
    }

    async fn sign_out(&self) -> AuthorityResult<()> {
        let previous = self.cache.write().await.take();
        self.persist(None).await;

        let Some(session) = previous else {
            return Ok(());
        };

        let request = self
            .client
            .post(self.config.url("/auth/v1/logout"))
            .bearer_auth(&session.access_token);
        let response = self.with_apikey(request).send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn refresh_session(&self) -> AuthorityResult<Session> {
        let current = self
            .current_session()
            .await
            .ok_or(AuthorityError::Unauthorized)?;
        let refresh_token = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthorityError::Unauthorized)?;

        let token =
            retry_with_backoff(move || self.request_refresh(refresh_token), AuthorityError::is_transient)
                .await?;

        let now = unix_now();
        let expires_at = token.expires_at.unwrap_or_else(|| {
            now.saturating_add(token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
        });
        let (subject_id, email, is_admin) = match &token.user {
            Some(user) => (
                user.id.clone(),
                user.email.clone(),
                admin_claim(&user.app_metadata),
            ),
            None => (current.subject_id.clone(), current.email.clone(), current.is_admin),
        };

        let refreshed = Session {
            subject_id,
            email,
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| current.refresh_token.clone()),
            issued_at: now,
            expires_at,
            is_admin,
        };

        debug!(subject = %refreshed.subject_id, expires_at, "session refreshed");
        self.store(refreshed.clone()).await;
        Ok(refreshed)
    }
}
