//! REST API client module for the civic portal backend.
//!
//! This module provides the `ApiClient` for grievance, welfare and ward
//! endpoints. Requests carry the session's bearer token; a 401 from the
//! server ends the session regardless of the locally stored expiry.

pub mod client;
pub mod error;

pub use client::{ApiClient, Navigator, NoopNavigator, LOGIN_ROUTE};
pub use error::ApiError;
