use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::token::DecodedClaims;

/// Who is signed in, as read from the access token's claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl From<&DecodedClaims> for SessionIdentity {
    fn from(claims: &DecodedClaims) -> Self {
        Self {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
        }
    }
}

/// Observable session record shared by the request client and any front end.
///
/// `None` means logged out. Subscribers are notified on every change.
pub struct SessionState {
    identity: watch::Sender<Option<SessionIdentity>>,
    loading: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            identity,
            loading: AtomicBool::new(false),
        }
    }

    pub fn set_identity(&self, identity: Option<SessionIdentity>) {
        self.identity.send_replace(identity);
    }

    pub fn current_identity(&self) -> Option<SessionIdentity> {
        self.identity.borrow().clone()
    }

    /// The identity, with both fields empty when logged out
    pub fn user(&self) -> SessionIdentity {
        self.current_identity().unwrap_or_default()
    }

    /// True iff an identity is present. Token expiry is not consulted.
    pub fn is_authenticated(&self) -> bool {
        self.identity.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionIdentity>> {
        self.identity.subscribe()
    }

    /// Whether session restoration is still running
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
