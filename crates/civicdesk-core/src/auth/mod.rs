//! Authentication module for the portal session.
//!
//! This module provides:
//! - `SessionManager`: token lifecycle with absolute expiry and fail-closed reads
//! - `SessionStore`: storage seam with memory, file and keychain backends
//! - `ExpiryWatcher`: periodic background expiry check
//! - `AuthContext`: signed-in user, role gating, login and logout
//!
//! Tokens default to a one day lifetime. The server remains the authority:
//! a 401 on any request ends the session immediately.

pub mod clock;
pub mod context;
pub mod duration;
pub mod session;
pub mod store;
pub mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{AccessError, AuthContext, SessionStatus};
pub use duration::{parse_duration, try_parse_duration, DEFAULT_TOKEN_LIFETIME};
pub use session::{ActiveSession, SessionError, SessionManager, SessionState, StoredSession};
pub use store::{FileStore, KeyringStore, MemoryStore, SessionStore, StoreError};
pub use watcher::{ExpiryWatcher, DEFAULT_CHECK_INTERVAL_SECS};
