//! Application-level authentication state and role gating.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError};
use crate::models::{Role, UserRecord};

use super::session::{SessionError, SessionManager, SessionState};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("Please log in to continue")]
    NotAuthenticated,

    #[error("{} accounts cannot open this page", .role.label())]
    Forbidden { role: Role },
}

/// Snapshot for status displays
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub remaining: Duration,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Option<UserRecord>,
}

impl SessionStatus {
    /// e.g. "2h 5m", "45m", "expired"
    pub fn remaining_display(&self) -> String {
        let minutes = self.remaining.num_minutes();
        if self.remaining <= Duration::zero() {
            "expired".to_string()
        } else if minutes < 1 {
            "under a minute".to_string()
        } else if minutes < 60 {
            format!("{}m", minutes)
        } else if minutes < 1440 {
            format!("{}h {}m", minutes / 60, minutes % 60)
        } else {
            format!("{}d {}h", minutes / 1440, (minutes % 1440) / 60)
        }
    }
}

/// Consumer of the session used by the rest of the application.
pub struct AuthContext {
    api: ApiClient,
    token_lifetime: String,
}

impl AuthContext {
    pub fn new(api: ApiClient, token_lifetime: &str) -> Self {
        Self {
            api,
            token_lifetime: token_lifetime.to_string(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        self.api.session()
    }

    /// Startup validation. A valid token without a stored user counts as
    /// corrupt and is cleared.
    pub fn restore(&self) -> Option<UserRecord> {
        match self.session().session() {
            Ok(active) => match active.user {
                Some(user) => {
                    debug!(user = %user.id, "Session restored");
                    Some(user)
                }
                None => {
                    warn!("Token stored without a user, clearing session");
                    self.session().clear_auth();
                    None
                }
            },
            Err(SessionError::Storage(e)) => {
                warn!(error = %e, "Could not restore session");
                None
            }
            Err(e) => {
                debug!(reason = %e, "No session to restore");
                None
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().get_token().is_some()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        if self.is_authenticated() {
            self.session().get_user()
        } else {
            None
        }
    }

    /// Gate a route on the signed-in user's role. An empty `allowed` list
    /// only requires a valid session.
    pub fn require_role(&self, allowed: &[Role]) -> Result<UserRecord, AccessError> {
        let user = self.current_user().ok_or(AccessError::NotAuthenticated)?;
        if allowed.is_empty() || allowed.contains(&user.role) {
            Ok(user)
        } else {
            Err(AccessError::Forbidden { role: user.role })
        }
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<UserRecord, ApiError> {
        self.api.login(identifier, password, &self.token_lifetime).await
    }

    pub async fn logout(&self) {
        self.api.logout().await;
    }

    pub fn status(&self) -> SessionStatus {
        let session = self.session();
        let state = session.state();
        let remaining = session.time_until_expiry();
        SessionStatus {
            state,
            remaining,
            expires_at: (remaining > Duration::zero()).then(|| session.now() + remaining),
            user: session.get_user(),
        }
    }
}
