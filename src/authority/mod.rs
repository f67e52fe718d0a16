//! Remote collaborators: the BaaS authority and the cached session.
//!
//! Everything in `gatekeeper` talks to these traits only, so the HTTP
//! implementations and the mocks are interchangeable.

pub mod http;
pub mod mock;
pub mod retry;
pub mod traits;

pub use http::{HttpAuthority, HttpAuthorityConfig, HttpSessionAccessor};
pub use traits::{
    unix_now, AdminActionRecord, AuthorityError, AuthorityResult, RemoteAuthority,
    RemoteDecision, RiskLevel, SecurityEvent, Session, SessionAccessor,
};
