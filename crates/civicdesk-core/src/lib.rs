//! civicdesk core - client-side session layer for the civic services portal.
//!
//! This crate provides:
//! - `auth`: token lifecycle (`SessionManager`), pluggable storage, expiry watcher
//!   and the role-aware `AuthContext`
//! - `api`: `ApiClient` that attaches the bearer token and treats 401 as logout
//! - `models`: the user record shared with the backend
//! - `config`: on-disk application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, Navigator, NoopNavigator};
pub use auth::{
    AuthContext, Clock, ExpiryWatcher, SessionError, SessionManager, SessionState, SessionStore,
    StoreError, SystemClock,
};
pub use config::{Config, StorageKind};
pub use models::{Role, UserRecord};
