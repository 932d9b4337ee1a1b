//! HTTP clients for the identity provider and the protected API.
//!
//! `IdentityClient` performs the token, refresh and registration calls.
//! `ApiClient` is the path every other request takes: it asks the
//! `AuthManager` for a live access token and attaches it as a bearer token.

pub mod client;
pub mod error;
pub mod identity;

pub use client::ApiClient;
pub use error::{ApiError, ErrorBody, RequestError};
pub use identity::{IdentityClient, RegisterRequest};
