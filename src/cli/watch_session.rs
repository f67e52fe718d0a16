use super::config::RentguardConfig;
use rentguard::authority::{HttpAuthority, HttpSessionAccessor, SessionAccessor};
use rentguard::gatekeeper::{
    format_duration, AuditTrail, SessionEvent, SessionMonitor, SignOutReason,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Watch the cached session, printing monitor events until sign-out or
/// Ctrl-C.
pub async fn execute(
    config: &RentguardConfig,
    session_path: Option<PathBuf>,
    auto_extend: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = config.authority.http_config();
    let path = session_path.unwrap_or_else(|| config.session.cache_path());

    let accessor: Arc<dyn SessionAccessor> =
        Arc::new(HttpSessionAccessor::load(http.clone(), &path)?);
    let Some(session) = accessor.current_session().await else {
        return Err(format!("No session found at '{}'. Sign in first.", path.display()).into());
    };
    let authority = Arc::new(HttpAuthority::new(http)?.with_session(Arc::clone(&accessor)));

    let (monitor, mut events) =
        SessionMonitor::new(accessor, config.session.monitor_config());
    let monitor = Arc::new(monitor.with_audit(AuditTrail::new(authority)));
    let handle = Arc::clone(&monitor).spawn();

    println!("👀 Watching session for {} (Ctrl-C to stop)", session.subject_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::WarningRaised { remaining }) => {
                    println!("⚠️  Session expires in {}", format_duration(remaining));
                    if auto_extend {
                        if let Err(e) = monitor.extend().await {
                            warn!(error = %e, "could not extend session");
                        }
                    } else {
                        println!("   Re-run with --auto-extend or sign in again to stay signed in.");
                    }
                }
                Some(SessionEvent::Countdown { remaining }) => {
                    println!("   {} left", format_duration(remaining));
                }
                Some(SessionEvent::Refreshed { expires_at }) => {
                    println!("🔄 Session extended (expires at {})", expires_at);
                }
                Some(SessionEvent::SignedOut { reason }) => {
                    match reason {
                        SignOutReason::Expired => println!("🔒 Session expired, signed out"),
                        SignOutReason::UserRequested => println!("🔒 Signed out"),
                    }
                    break;
                }
                None => break,
            },
            _ = &mut ctrl_c => {
                println!("Stopping");
                break;
            }
        }
    }

    handle.stop();
    handle.join().await;
    Ok(())
}
