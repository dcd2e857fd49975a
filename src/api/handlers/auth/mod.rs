//! Browser-facing authentication: password login, MFA step-up, session
//! inspection and logout.
//!
//! Sessions are stateless signed cookies; nothing here touches the store
//! except through the login orchestrator and the device registry.

pub mod login;
pub mod mfa;
pub mod session;
pub mod types;

pub(crate) use session::current_session;
