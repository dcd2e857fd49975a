//! Multi-factor devices and their challenge/response state machine.
//!
//! Flow Overview:
//! 1) A user registers a device (TOTP, out-of-band SMS or hardware key); it
//!    starts unconfirmed.
//! 2) The first valid response confirms it; the first confirmed device
//!    becomes the profile's default.
//! 3) At login the orchestrator asks [`challenge::ChallengeEngine`] for
//!    challenge material and later verifies the user's response.
//!
//! One-time codes are bound to a time step that only ever moves forward
//! (`last_t`), persisted with a compare-and-swap so two concurrent requests
//! cannot both redeem the same code.

pub mod challenge;
pub mod device;
pub mod hardware_key;
pub mod out_of_band;
pub mod registry;
pub mod totp;

pub use challenge::{ChallengeEngine, ChallengeMaterial};
pub use device::{Device, DeviceKind, DeviceSummary, LoginFormKind, Profile};
pub use registry::{DeviceError, DeviceRegistry};
