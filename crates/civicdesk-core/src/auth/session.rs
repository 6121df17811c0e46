//! Token lifecycle: persist, validate and invalidate the client session.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::UserRecord;

use super::clock::{Clock, SystemClock};
use super::duration::{parse_duration, DEFAULT_TOKEN_LIFETIME};
use super::store::{SessionStore, StoreError};

/// Key holding the single serialized session record
pub const SESSION_KEY: &str = "session";

/// Keys of the older three-entry layout. Read when `SESSION_KEY` is absent
/// and removed on the next write.
pub const LEGACY_TOKEN_KEY: &str = "token";
pub const LEGACY_EXPIRY_KEY: &str = "token_expiry";
pub const LEGACY_USER_KEY: &str = "user";

const ALL_KEYS: [&str; 4] = [SESSION_KEY, LEGACY_TOKEN_KEY, LEGACY_EXPIRY_KEY, LEGACY_USER_KEY];

/// Window before expiry in which a session counts as expiring soon
const EXPIRING_SOON_MINUTES: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Absolute expiry in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
}

impl StoredSession {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.token_expiry.and_then(DateTime::from_timestamp_millis)
    }

    /// Missing expiry counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |expiry| now >= expiry)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at()
            .map(|expiry| (expiry - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => {
                let remaining = expiry - now;
                remaining > Duration::zero() && remaining <= Duration::minutes(EXPIRING_SOON_MINUTES)
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.token.is_none() && self.token_expiry.is_none() && self.user.is_none()
    }
}

/// Derived view of the stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Valid,
    /// Valid with an hour or less left
    Expiring,
    /// Token still stored but past expiry. Collapses to `Unauthenticated` on
    /// the next `get_token` or `check`.
    Expired,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Valid | SessionState::Expiring)
    }
}

/// A token that was valid when it was read.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: Option<UserRecord>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Session expired")]
    Expired,

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Stored session is corrupt: {0}")]
    Corrupt(String),
}

/// Single authority for the client's session credential.
///
/// The typed methods (`session`, `try_set_token`, ...) report every failure.
/// The plain methods log storage faults and degrade to "no session".
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ===== Typed API =====

    /// Current valid session.
    ///
    /// Anything other than a valid token (missing, expired, corrupt) clears
    /// the stored session. Storage faults leave it untouched.
    pub fn session(&self) -> Result<ActiveSession, SessionError> {
        let _guard = self.lock();
        let stored = match self.load() {
            Ok(stored) => stored,
            Err(SessionError::Corrupt(msg)) => {
                warn!(error = %msg, "Discarding corrupt session");
                self.clear_locked();
                return Err(SessionError::Corrupt(msg));
            }
            Err(e) => return Err(e),
        };

        let now = self.now();
        match (stored.token.clone(), stored.expires_at()) {
            (Some(token), Some(expires_at)) if now < expires_at => Ok(ActiveSession {
                token,
                expires_at,
                user: stored.user,
            }),
            (Some(_), _) => {
                debug!(expiry = ?stored.token_expiry, "Session expired, clearing");
                self.clear_locked();
                Err(SessionError::Expired)
            }
            (None, _) => {
                if !stored.is_empty() {
                    self.clear_locked();
                }
                Err(SessionError::NotAuthenticated)
            }
        }
    }

    /// Absolute expiry for a lifetime string. Spans that would overflow the
    /// calendar fall back to one day.
    fn expiry_for(&self, duration: &str) -> DateTime<Utc> {
        let now = self.now();
        now.checked_add_signed(parse_duration(duration)).unwrap_or_else(|| {
            warn!(duration = duration, "Token lifetime out of range, using 1d");
            now + Duration::days(1)
        })
    }

    /// Store a token expiring `duration` from now. Returns the expiry.
    pub fn try_set_token(&self, token: &str, duration: &str) -> Result<DateTime<Utc>, SessionError> {
        let expires_at = self.expiry_for(duration);
        self.mutate(|s| {
            s.token = Some(token.to_string());
            s.token_expiry = Some(expires_at.timestamp_millis());
        })?;
        debug!(%expires_at, "Token stored");
        Ok(expires_at)
    }

    /// Store token, expiry and user in one write. Either all three land or
    /// none do.
    pub fn try_set_session(
        &self,
        token: &str,
        duration: &str,
        user: &UserRecord,
    ) -> Result<DateTime<Utc>, SessionError> {
        let expires_at = self.expiry_for(duration);
        self.mutate(|s| {
            s.token = Some(token.to_string());
            s.token_expiry = Some(expires_at.timestamp_millis());
            s.user = Some(user.clone());
        })?;
        debug!(%expires_at, user = %user.id, "Session stored");
        Ok(expires_at)
    }

    pub fn try_set_user(&self, user: &UserRecord) -> Result<(), SessionError> {
        self.mutate(|s| s.user = Some(user.clone()))
    }

    /// Snapshot of the derived state without side effects.
    pub fn state(&self) -> SessionState {
        match self.load() {
            Ok(stored) => Self::state_of(&stored, self.now()),
            Err(e) => {
                warn!(error = %e, "Failed to read session state");
                SessionState::Unauthenticated
            }
        }
    }

    /// Periodic check: clears an expired or corrupt session and reports the
    /// resulting state.
    pub fn check(&self) -> SessionState {
        match self.session() {
            Ok(active) => {
                if active.expires_at - self.now() <= Duration::minutes(EXPIRING_SOON_MINUTES) {
                    SessionState::Expiring
                } else {
                    SessionState::Valid
                }
            }
            Err(SessionError::Storage(e)) => {
                warn!(error = %e, "Session check could not read storage");
                SessionState::Unauthenticated
            }
            Err(_) => SessionState::Unauthenticated,
        }
    }

    // ===== Fault-tolerant API =====

    pub fn set_token(&self, token: &str, duration: &str) {
        if let Err(e) = self.try_set_token(token, duration) {
            warn!(error = %e, "Failed to store token");
        }
    }

    pub fn set_token_default(&self, token: &str) {
        self.set_token(token, DEFAULT_TOKEN_LIFETIME);
    }

    /// Token if present and unexpired. Any other outcome clears the session.
    pub fn get_token(&self) -> Option<String> {
        match self.session() {
            Ok(active) => Some(active.token),
            Err(SessionError::Storage(e)) => {
                warn!(error = %e, "Failed to read token");
                None
            }
            Err(_) => None,
        }
    }

    pub fn is_token_expired(&self) -> bool {
        match self.load() {
            Ok(stored) => stored.is_expired_at(self.now()),
            Err(e) => {
                warn!(error = %e, "Failed to read token expiry");
                true
            }
        }
    }

    pub fn is_token_expiring_soon(&self) -> bool {
        match self.load() {
            Ok(stored) => stored.is_expiring_soon_at(self.now()),
            Err(e) => {
                warn!(error = %e, "Failed to read token expiry");
                false
            }
        }
    }

    /// Time left before expiry, never negative.
    pub fn time_until_expiry(&self) -> Duration {
        match self.load() {
            Ok(stored) => stored.remaining_at(self.now()),
            Err(e) => {
                warn!(error = %e, "Failed to read token expiry");
                Duration::zero()
            }
        }
    }

    pub fn set_user(&self, user: &UserRecord) {
        if let Err(e) = self.try_set_user(user) {
            warn!(error = %e, "Failed to store user");
        }
    }

    pub fn get_user(&self) -> Option<UserRecord> {
        match self.load() {
            Ok(stored) => stored.user,
            Err(e) => {
                warn!(error = %e, "Failed to read user");
                None
            }
        }
    }

    /// Remove token, expiry and user. Safe to call repeatedly.
    pub fn clear_auth(&self) {
        let _guard = self.lock();
        self.clear_locked();
        info!("Session cleared");
    }

    // ===== Storage =====

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn clear_locked(&self) {
        for key in ALL_KEYS {
            if let Err(e) = self.store.remove(key) {
                warn!(key = key, error = %e, "Failed to remove session key");
            }
        }
    }

    fn state_of(stored: &StoredSession, now: DateTime<Utc>) -> SessionState {
        if stored.token.is_none() {
            SessionState::Unauthenticated
        } else if stored.is_expired_at(now) {
            SessionState::Expired
        } else if stored.is_expiring_soon_at(now) {
            SessionState::Expiring
        } else {
            SessionState::Valid
        }
    }

    fn load(&self) -> Result<StoredSession, SessionError> {
        match self.store.get(SESSION_KEY)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| SessionError::Corrupt(e.to_string())),
            None => self.load_legacy(),
        }
    }

    fn load_legacy(&self) -> Result<StoredSession, SessionError> {
        let token = self.store.get(LEGACY_TOKEN_KEY)?;

        // Unparsable expiry is treated as missing, which reads as expired
        let token_expiry = self
            .store
            .get(LEGACY_EXPIRY_KEY)?
            .and_then(|raw| match raw.trim().parse::<i64>() {
                Ok(ms) => Some(ms),
                Err(e) => {
                    warn!(value = %raw, error = %e, "Ignoring unparsable token expiry");
                    None
                }
            });

        let user = self
            .store
            .get(LEGACY_USER_KEY)?
            .and_then(|raw| match serde_json::from_str::<UserRecord>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Ignoring unparsable stored user");
                    None
                }
            });

        Ok(StoredSession {
            token,
            token_expiry,
            user,
        })
    }

    fn save(&self, stored: &StoredSession) -> Result<(), SessionError> {
        if stored.is_empty() {
            self.clear_locked();
            return Ok(());
        }
        self.store.set(SESSION_KEY, &serde_json::to_string(stored).map_err(StoreError::from)?)?;
        // The record is already written; stale legacy keys are ignored while it exists
        for key in [LEGACY_TOKEN_KEY, LEGACY_EXPIRY_KEY, LEGACY_USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key = key, error = %e, "Failed to remove legacy session key");
            }
        }
        Ok(())
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoredSession)) -> Result<(), SessionError> {
        let _guard = self.lock();
        let mut stored = match self.load() {
            Ok(stored) => stored,
            Err(SessionError::Corrupt(msg)) => {
                warn!(error = %msg, "Overwriting corrupt session");
                StoredSession::default()
            }
            Err(e) => return Err(e),
        };
        apply(&mut stored);
        self.save(&stored)
    }
}

// ============================================================================
// Tests
// ============================================================================
