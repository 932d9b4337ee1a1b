//! Client for the identity provider's token endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::ApiError;
use crate::auth::{CredentialPair, RefreshError};
use crate::config::Config;

const TOKEN_PATH: &str = "token/";
const REFRESH_PATH: &str = "token/refresh/";
const REGISTER_PATH: &str = "register/";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: String,
    refresh: String,
}

impl From<TokenResponse> for CredentialPair {
    fn from(response: TokenResponse) -> Self {
        CredentialPair::new(response.access, response.refresh)
    }
}

/// Account details for `register/`.
#[derive(Clone, Serialize)]
pub struct RegisterRequest {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub password2: String,
}

impl std::fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("phone", &self.phone)
            .finish_non_exhaustive()
    }
}

/// Talks to `token/`, `token/refresh/` and `register/`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct IdentityClient {
    client: Client,
    base_url: String,
}

impl IdentityClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config.auth_base_url()))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Exchange email and password for a fresh pair
    pub async fn obtain_pair(&self, email: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let response: TokenResponse = self
            .post(TOKEN_PATH, &LoginRequest { email, password })
            .await?;
        debug!(email = email, "Obtained credential pair");
        Ok(response.into())
    }

    /// Trade a refresh token for a new pair. Issuers usually rotate both tokens.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, RefreshError> {
        let response: TokenResponse = self
            .post(
                REFRESH_PATH,
                &RefreshRequest {
                    refresh: refresh_token,
                },
            )
            .await?;
        debug!("Refresh exchange succeeded");
        Ok(response.into())
    }

    /// Create an account. Returns whatever the provider sends back.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Value, ApiError> {
        let created: Value = self.post(REGISTER_PATH, request).await?;
        debug!(email = %request.email, "Registered account");
        Ok(created)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)))
    }
}
