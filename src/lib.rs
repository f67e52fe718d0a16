//! Rentguard - client-side access control for a rental marketplace
//!
//! The client is a thin shell over a Backend-as-a-Service that owns all
//! enforcement. This crate covers the four pieces the client still runs:
//!
//! - Rate limiting: fail-open checks before sensitive actions
//! - Admin gate: per-entry remote verification, fail closed
//! - Session monitor: expiry warning and forced sign-out
//! - Audit trail: best-effort security and admin-action logging
//!
//! Remote calls go through the `authority` traits; nothing here keeps
//! process-wide state.

pub mod authority;
pub mod gatekeeper;
pub mod identity;
