//! Core library for tokenwarden.
//!
//! Client-side session lifecycle: the access/refresh credential pair is kept
//! in a [`auth::CredentialStore`], checked for staleness by the
//! [`auth::TokenInspector`], renewed through the identity provider and
//! attached to every outbound call made through [`api::ApiClient`].

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, IdentityClient, RequestError};
pub use auth::{
    AuthManager, AuthRequestFailure, CredentialPair, CredentialStore, DecodedClaims, RefreshError,
    SessionIdentity, SessionState, TokenInspector,
};
pub use config::Config;
