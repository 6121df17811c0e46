//! Data models shared with the portal backend.
//!
//! - `UserRecord`: the signed-in user as returned by the auth endpoint
//! - `Role`: citizen, councillor, officer or admin

pub mod user;

pub use user::{Role, UserRecord};
