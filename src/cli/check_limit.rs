use super::config::RentguardConfig;
use rentguard::authority::{unix_now, HttpAuthority};
use rentguard::gatekeeper::{format_duration, ActionClass, RateLimitClient};
use rentguard::identity::IdentifierKey;
use std::sync::Arc;
use std::time::Duration;

/// Installation id used when the config does not set one.
const ANONYMOUS_INSTALLATION: &str = "anonymous";

/// Check (and consume one unit of) the remote rate limit for `action`.
pub async fn execute(
    config: &RentguardConfig,
    action: ActionClass,
    subject: Option<String>,
    max: Option<u32>,
    window: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let secret = config
        .rate_limit
        .identifier_secret
        .clone()
        .ok_or("rate_limit.identifier_secret is not set (run `rentguard init-config`)")?;
    let installation_id = config
        .rate_limit
        .installation_id
        .clone()
        .unwrap_or_else(|| ANONYMOUS_INSTALLATION.to_string());

    let authority = Arc::new(HttpAuthority::new(config.authority.http_config())?);
    let client = RateLimitClient::new(authority, IdentifierKey::from_secret(secret), installation_id);
    client.set_subject(subject).await;

    let mut limit = config.rate_limit.limit_for(action);
    if let Some(max) = max {
        limit.max_requests = max;
    }
    if let Some(window) = window {
        limit.window_secs = window.as_secs().max(1);
    }

    let decision = client.check_limit(action, &limit).await;
    let resets_in = Duration::from_secs(decision.reset_time.saturating_sub(unix_now()));

    if decision.allowed {
        println!("✅ {} allowed", action);
    } else {
        println!("⛔ {} denied", action);
    }
    println!(
        "   Remaining: {}/{} per {}",
        decision.remaining,
        limit.max_requests,
        format_duration(Duration::from_secs(limit.window_secs))
    );
    println!("   Window resets in {}", format_duration(resets_in));
    if let Some(retry_after) = decision.retry_after {
        println!("   Retry after {}", format_duration(retry_after));
    }

    Ok(())
}
