//! Session lifecycle: login, registration, logout, restoration and refresh.
//!
//! `AuthManager` owns the credential store and session state. Every request
//! goes through [`AuthManager::authorize`], which hands back a live access
//! token and renews it when stale. Only one refresh runs at a time: callers
//! that find the token stale while a refresh is pending wait on that refresh
//! instead of starting their own, since issuers rotate the refresh token on use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialPair, CredentialStore};
use super::error::{AuthRequestFailure, RefreshError};
use super::session::{SessionIdentity, SessionState};
use super::token::TokenInspector;
use crate::api::identity::RegisterRequest;
use crate::api::{IdentityClient, RequestError};
use crate::config::Config;

type PendingRefresh = Shared<BoxFuture<'static, Result<CredentialPair, RefreshError>>>;

/// What to do with the session when the issuer rejects the refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshFailurePolicy {
    /// Leave tokens and identity in place; the caller sees the error.
    #[default]
    KeepSession,
    /// Log out. Network failures never trigger this.
    ClearSession,
}

/// Outcome of checking the store before a request
enum Ticket {
    Unauthenticated,
    Live(CredentialPair),
    Refreshing(PendingRefresh),
}

pub struct AuthManager {
    store: CredentialStore,
    session: Arc<SessionState>,
    identity: IdentityClient,
    inspector: TokenInspector,
    policy: RefreshFailurePolicy,
    /// Bumped on login and logout so late refresh results are dropped
    epoch: Arc<AtomicU64>,
    in_flight: Mutex<Option<PendingRefresh>>,
}

impl AuthManager {
    pub fn new(store: CredentialStore, identity: IdentityClient, session: Arc<SessionState>) -> Self {
        Self {
            store,
            session,
            identity,
            inspector: TokenInspector::new(),
            policy: RefreshFailurePolicy::default(),
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = config.credential_store()?;
        let identity = IdentityClient::new(config).context("Failed to build HTTP client")?;
        Ok(Self::new(store, identity, Arc::new(SessionState::new()))
            .with_inspector(TokenInspector::with_leeway(config.clock_skew_leeway_secs))
            .with_refresh_failure_policy(config.refresh_failure_policy))
    }

    pub fn with_inspector(mut self, inspector: TokenInspector) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_refresh_failure_policy(mut self, policy: RefreshFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn inspector(&self) -> &TokenInspector {
        &self.inspector
    }

    /// Log in with email and password, establishing the session on success.
    pub async fn login(&self, email: &str, password: &str) -> Result<CredentialPair, AuthRequestFailure> {
        let pair = self
            .identity
            .obtain_pair(email, password)
            .await
            .map_err(|e| {
                warn!(email = email, error = %e, "Login failed");
                AuthRequestFailure::from(&e)
            })?;

        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.establish(&pair).map_err(|e| {
            error!(error = %format!("{:#}", e), "Failed to establish session after login");
            AuthRequestFailure::generic()
        })?;

        info!(email = email, "Logged in");
        Ok(pair)
    }

    /// Create an account, then log in with the same credentials.
    ///
    /// The registration payload is returned even if the follow-up login fails.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Value, AuthRequestFailure> {
        let created = self.identity.register(request).await.map_err(|e| {
            warn!(email = %request.email, error = %e, "Registration failed");
            AuthRequestFailure::from(&e)
        })?;

        if let Err(e) = self.login(&request.email, &request.password).await {
            warn!(email = %request.email, error = %e, "Login after registration failed");
        }

        Ok(created)
    }

    /// Forget the credential pair and the identity.
    pub fn logout(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.session.set_identity(None);
        self.store.clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Persist `pair` and derive the session identity from its access token.
    pub fn establish(&self, pair: &CredentialPair) -> Result<SessionIdentity> {
        establish(&self.store, &self.session, &self.inspector, pair)
    }

    /// Rebuild the session from stored tokens at startup, refreshing if stale.
    ///
    /// Returns `Ok(None)` when there is no complete stored pair.
    pub async fn restore(&self) -> Result<Option<SessionIdentity>, RequestError> {
        self.session.set_loading(true);
        let result = self.restore_inner().await;
        self.session.set_loading(false);
        result
    }

    async fn restore_inner(&self) -> Result<Option<SessionIdentity>, RequestError> {
        match self.ticket()? {
            Ticket::Unauthenticated => {
                debug!("No stored session to restore");
                Ok(None)
            }
            Ticket::Live(pair) => self
                .establish(&pair)
                .map(Some)
                .map_err(RequestError::storage),
            Ticket::Refreshing(pending) => {
                self.await_refresh(pending).await?;
                Ok(self.session.current_identity())
            }
        }
    }

    /// Access token to attach to the next request.
    ///
    /// `None` means the request should go out unauthenticated. A stale token
    /// is refreshed first; a failed refresh is returned as an error.
    pub async fn authorize(&self) -> Result<Option<String>, RequestError> {
        match self.ticket()? {
            Ticket::Unauthenticated => {
                debug!("No complete credential pair, sending unauthenticated");
                Ok(None)
            }
            Ticket::Live(pair) => Ok(Some(pair.access)),
            Ticket::Refreshing(pending) => Ok(Some(self.await_refresh(pending).await?.access)),
        }
    }

    /// Stored access token with no expiry check
    pub fn current_access_token(&self) -> Option<String> {
        match self.store.get() {
            Ok(stored) => stored.access,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Failed to read stored access token");
                None
            }
        }
    }

    /// Check the store and join or start a refresh, all under the in-flight lock.
    fn ticket(&self) -> Result<Ticket, RequestError> {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref().filter(|p| p.peek().is_none()) {
            debug!("Joining in-flight refresh");
            return Ok(Ticket::Refreshing(pending.clone()));
        }
        // Finished but never collected (its waiters were dropped)
        *slot = None;

        let stored = self.store.get().map_err(RequestError::storage)?;
        let Some(pair) = stored.pair() else {
            return Ok(Ticket::Unauthenticated);
        };
        if !self.inspector.is_expired(&pair.access) {
            return Ok(Ticket::Live(pair));
        }

        info!("Access token stale, starting refresh");
        let pending = self.start_refresh(pair.refresh);
        *slot = Some(pending.clone());
        Ok(Ticket::Refreshing(pending))
    }

    /// The exchange runs as its own task so a dropped request never aborts it.
    fn start_refresh(&self, refresh_token: String) -> PendingRefresh {
        let task = RefreshTask {
            identity: self.identity.clone(),
            store: self.store.clone(),
            session: Arc::clone(&self.session),
            inspector: self.inspector,
            policy: self.policy,
            epoch: Arc::clone(&self.epoch),
            started_at_epoch: self.epoch.load(Ordering::Acquire),
        };
        let handle = tokio::spawn(task.run(refresh_token));

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(RefreshError::Interrupted(e.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn await_refresh(&self, pending: PendingRefresh) -> Result<CredentialPair, RefreshError> {
        // Poll a clone so `pending` can still be compared against the slot.
        let result = pending.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }
        result
    }
}

fn establish(
    store: &CredentialStore,
    session: &SessionState,
    inspector: &TokenInspector,
    pair: &CredentialPair,
) -> Result<SessionIdentity> {
    let claims = inspector
        .decode_claims(&pair.access)
        .context("Issued access token could not be decoded")?;
    store.save(pair)?;

    let identity = SessionIdentity::from(&claims);
    session.set_identity(Some(identity.clone()));
    session.set_loading(false);
    debug!(user_id = ?identity.user_id, "Session established");
    Ok(identity)
}

struct RefreshTask {
    identity: IdentityClient,
    store: CredentialStore,
    session: Arc<SessionState>,
    inspector: TokenInspector,
    policy: RefreshFailurePolicy,
    epoch: Arc<AtomicU64>,
    started_at_epoch: u64,
}

impl RefreshTask {
    fn session_changed(&self) -> bool {
        self.epoch.load(Ordering::Acquire) != self.started_at_epoch
    }

    async fn run(self, refresh_token: String) -> Result<CredentialPair, RefreshError> {
        match self.identity.refresh(&refresh_token).await {
            Ok(pair) => {
                if self.session_changed() {
                    warn!("Discarding refreshed credentials, session changed mid-flight");
                    return Err(RefreshError::SessionChanged);
                }
                establish(&self.store, &self.session, &self.inspector, &pair)
                    .map_err(|e| RefreshError::Persist(format!("{:#}", e)))?;
                info!("Access token refreshed");
                Ok(pair)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                if e.is_rejection()
                    && self.policy == RefreshFailurePolicy::ClearSession
                    && !self.session_changed()
                {
                    info!("Clearing session after rejected refresh");
                    self.session.set_identity(None);
                    if let Err(clear_err) = self.store.clear() {
                        error!(error = %format!("{:#}", clear_err), "Failed to clear credentials");
                    }
                }
                Err(e)
            }
        }
    }
}
