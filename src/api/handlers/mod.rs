pub mod auth;
pub mod health;
pub mod me;
pub mod oauth2;
pub(crate) mod utils;
