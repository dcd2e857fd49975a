//! OAuth2/OIDC authorization server core.

pub mod client;
pub mod code;
pub mod error;
pub mod guard;
pub mod id_token;
pub mod pkce;
pub mod scope;
pub mod token;

pub use client::{Client, ClientCredentials, ClientRegistry, ClientType, GrantType};
pub use code::CodeEngine;
pub use error::{ErrorResponse, OAuthError};
pub use scope::ScopeSet;
pub use token::TokenEngine;
