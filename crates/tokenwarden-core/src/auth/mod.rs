//! Authentication module for managing the credential pair and session.
//!
//! This module provides:
//! - `CredentialStore`: Access/refresh token persistence with a retention ceiling
//! - `TokenInspector`: Claim decoding and expiry checks
//! - `SessionState`: Observable record of the signed-in identity
//! - `AuthManager`: Login, logout, restoration and de-duplicated refresh
//!
//! Stored tokens expire after one day regardless of their embedded expiry.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::{
    CredentialPair, CredentialStore, FileBackend, KeyringBackend, MemoryBackend, SecretBackend,
    StoredCredentials,
};
pub use error::{AuthRequestFailure, RefreshError};
pub use manager::{AuthManager, RefreshFailurePolicy};
pub use session::{SessionIdentity, SessionState};
pub use token::{DecodedClaims, TokenError, TokenInspector};
