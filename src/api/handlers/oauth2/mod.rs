//! OAuth2 and OpenID Connect endpoints.

pub mod authorize;
pub mod discovery;
pub mod revoke;
pub mod token;
pub mod userinfo;
