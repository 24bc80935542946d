//! Authentication Module
//!
//! Read side of the session written by the host's login and logout flows.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{KeyValueStore, StorageError};

/// Storage key of the access token
pub const ACCESS_TOKEN_KEY: &str = "access";
/// Storage key of the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh";

/// Tokens issued by the backend at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Read-only view of the persisted session. Every call is an independent snapshot.
pub trait SessionStore: Send + Sync {
    fn load_session(&self) -> Option<Session>;

    fn access_token(&self) -> Option<String> {
        self.load_session().map(|s| s.access_token)
    }
}

impl SessionStore for KeyValueStore {
    fn load_session(&self) -> Option<Session> {
        let access_token = match self.load::<String>(ACCESS_TOKEN_KEY) {
            Ok(token) if !token.is_empty() => token,
            Ok(_) | Err(StorageError::NotFound(_)) => {
                debug!("No stored session found");
                return None;
            }
            Err(e) => {
                debug!("Stored session unreadable: {}", e);
                return None;
            }
        };

        Some(Session {
            access_token,
            refresh_token: self.load::<String>(REFRESH_TOKEN_KEY).ok(),
        })
    }
}

/// In-memory session for hosts that hand the tokens over directly
#[derive(Default)]
pub struct SharedSession {
    session: RwLock<Option<Session>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current session
    pub fn set_session(&self, session: Session) {
        info!("Session set");
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Clear the current session
    pub fn clear_session(&self) {
        info!("Session cleared");
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SessionStore for SharedSession {
    fn load_session(&self) -> Option<Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
