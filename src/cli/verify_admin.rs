use super::config::RentguardConfig;
use rentguard::authority::{HttpAuthority, HttpSessionAccessor, RemoteAuthority, SessionAccessor};
use rentguard::gatekeeper::{ActionRequirement, AdminGate, AuditTrail, GateOutcome};
use std::path::PathBuf;
use std::sync::Arc;

/// Run the admin gate once against the cached session.
pub async fn execute(
    config: &RentguardConfig,
    session_path: Option<PathBuf>,
    action: Option<String>,
    target: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = config.authority.http_config();
    let path = session_path.unwrap_or_else(|| config.session.cache_path());

    let accessor: Arc<dyn SessionAccessor> =
        Arc::new(HttpSessionAccessor::load(http.clone(), &path)?);
    let authority: Arc<dyn RemoteAuthority> =
        Arc::new(HttpAuthority::new(http)?.with_session(Arc::clone(&accessor)));

    let gate = AdminGate::new(Arc::clone(&authority)).with_audit(AuditTrail::new(authority));
    let requirement = action.map(|action| {
        let requirement = ActionRequirement::new(action);
        match target {
            Some(target) => requirement.on_target(target),
            None => requirement,
        }
    });

    let session = accessor.current_session().await;
    match gate.enter(session.as_ref(), requirement.as_ref()).await {
        GateOutcome::Render(verification) => {
            println!("✅ Admin access verified");
            if let Some(requirement) = &requirement {
                println!("   Authorized for: {}", requirement.action);
            }
            println!("   Checked at: {}", verification.checked_at);
            Ok(())
        }
        GateOutcome::Denied { reason, .. } => {
            Err(format!("Access denied: {}. Return to the home page.", reason).into())
        }
        GateOutcome::RedirectToLogin => {
            Err(format!("No session found at '{}'. Sign in first.", path.display()).into())
        }
        GateOutcome::Abandoned => Err("Verification abandoned".into()),
    }
}
