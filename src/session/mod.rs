//! Stateless browser sessions.

pub mod codec;
pub mod signer;

pub use codec::{DecodeError, SessionClaims, SessionCodec};
pub use signer::{KeyMaterial, Signer};
