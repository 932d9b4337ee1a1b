//! Authorized API client.
//!
//! Every call made through `ApiClient` first asks the `AuthManager` for a
//! live access token, which may trigger a (shared) refresh, and attaches it
//! as a bearer token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{ApiError, RequestError};
use crate::auth::AuthManager;
use crate::config::Config;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - the connection pool and the auth manager are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Arc<AuthManager>,
    /// Whether secure-only credentials may be sent to `base_url`
    transport_allowed: bool,
    /// Access token stored when the client was built
    construction_token: Option<String>,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a client for `config.base_url`.
    ///
    /// Whatever access token is stored right now becomes the fallback
    /// credential, unchecked. Each request still goes through
    /// `AuthManager::authorize`, whose token takes precedence. The fallback
    /// is dropped once the store no longer holds that token.
    pub fn new(config: &Config, auth: Arc<AuthManager>) -> Result<Self, RequestError> {
        let transport_allowed = !auth.store().secure_only()
            || config.is_secure_transport()
            || config.allow_insecure_transport;

        let construction_token = match auth.current_access_token() {
            Some(token) if transport_allowed => {
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| RequestError::InvalidRequest(e.to_string()))?;
                Some(token)
            }
            _ => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(ApiError::from)?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            auth,
            transport_allowed,
            construction_token,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// The construction-time token, while it is still the stored one
    fn fallback_token(&self) -> Option<String> {
        let token = self.construction_token.as_ref()?;
        match self.auth.current_access_token() {
            Some(current) if current == *token => Some(current),
            _ => None,
        }
    }

    fn attach(&self, builder: RequestBuilder, token: Option<String>) -> RequestBuilder {
        match token.or_else(|| self.fallback_token()) {
            Some(token) if self.transport_allowed => builder.bearer_auth(token),
            Some(_) => {
                warn!(base_url = %self.base_url, "Refusing to send secure credential over insecure transport");
                builder
            }
            None => builder,
        }
    }

    /// Send with a fresh credential, retrying 429s with exponential backoff.
    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, RequestError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let token = self.auth.authorize().await?;

            let mut builder = self.attach(self.client.request(method.clone(), &url), token);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await.map_err(ApiError::from)?;

            let status = response.status();
            if status.is_success() {
                debug!(method = %method, url = %url, status = status.as_u16(), "Request succeeded");
                return Ok(response);
            }

            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited.into());
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).into());
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, RequestError> {
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)).into())
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let response = self.execute::<()>(Method::GET, path, None).await?;
        Self::parse(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let response = self.execute(Method::POST, path, Some(body)).await?;
        Self::parse(response).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let response = self.execute(Method::PUT, path, Some(body)).await?;
        Self::parse(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), RequestError> {
        self.execute::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{access_token, refresh_token};
    use crate::auth::{
        CredentialPair, CredentialStore, MemoryBackend, RefreshError, SecretBackend, SessionState,
    };
    use crate::api::IdentityClient;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> Config {
        Config {
            base_url: server.uri(),
            allow_insecure_transport: true,
            ..Config::default()
        }
    }

    fn auth_manager(config: &Config, store: CredentialStore) -> Arc<AuthManager> {
        let identity = IdentityClient::with_client(reqwest::Client::new(), config.auth_base_url());
        Arc::new(AuthManager::new(store, identity, Arc::new(SessionState::new())))
    }

    fn client_with_pair(server: &MockServer, pair: Option<&CredentialPair>) -> ApiClient {
        let config = config(server);
        let store = CredentialStore::in_memory();
        if let Some(pair) = pair {
            store.save(pair).unwrap();
        }
        ApiClient::new(&config, auth_manager(&config, store)).unwrap()
    }

    async fn mount_refresh(server: &MockServer, from: &CredentialPair, to: &CredentialPair, delay: Duration) {
        Mock::given(method("POST"))
            .and(path("/user/token/refresh/"))
            .and(body_json(json!({ "refresh": from.refresh })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "access": to.access, "refresh": to.refresh }))
                    .set_delay(delay),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn has_auth_header(request: &wiremock::Request) -> bool {
        request.headers.get("authorization").is_some()
    }

    #[tokio::test]
    async fn test_attaches_live_token() {
        let server = MockServer::start().await;
        let pair = CredentialPair::new(access_token(1, "alice", 3600), refresh_token("R1"));
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .and(header("authorization", format!("Bearer {}", pair.access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with_pair(&server, Some(&pair));
        let courses: Value = client.get("courses/").await.unwrap();
        assert_eq!(courses, json!([{ "id": 1 }]));
    }

    #[tokio::test]
    async fn test_no_tokens_sends_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "detail": "Authentication credentials were not provided."
            })))
            .mount(&server)
            .await;

        let client = client_with_pair(&server, None);
        let err = client.get::<Value>("courses/").await.unwrap_err();
        match err {
            RequestError::Api(api) => {
                assert_eq!(api.status(), Some(401));
                assert_eq!(api.detail(), Some("Authentication credentials were not provided."));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!has_auth_header(&requests[0]));
    }

    #[tokio::test]
    async fn test_construction_uses_stored_access_unchecked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        // Access token without a refresh token: no per-request credential,
        // but the construction-time token still goes out.
        let config = config(&server);
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::new(backend.clone());
        let stale = access_token(1, "alice", -60);
        store
            .save(&CredentialPair::new(stale.clone(), refresh_token("R1")))
            .unwrap();
        backend.remove("refresh_token").unwrap();

        let client = ApiClient::new(&config, auth_manager(&config, store)).unwrap();
        let _: Value = client.get("courses/").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            requests[0].headers.get("authorization").unwrap().to_str().unwrap(),
            format!("Bearer {}", stale)
        );
    }

    #[tokio::test]
    async fn test_logout_stops_construction_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let pair = CredentialPair::new(access_token(1, "alice", 3600), refresh_token("R1"));
        let client = client_with_pair(&server, Some(&pair));
        client.auth().logout().unwrap();

        let _: Value = client.get("courses/").await.unwrap();
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!has_auth_header(&requests[0]));
    }

    #[tokio::test]
    async fn test_stale_token_refreshed_before_request() {
        let server = MockServer::start().await;
        let old = CredentialPair::new(access_token(1, "alice", -60), refresh_token("R1"));
        let new = CredentialPair::new(access_token(1, "alice", 3600), refresh_token("R2"));
        mount_refresh(&server, &old, &new, Duration::ZERO).await;
        Mock::given(method("POST"))
            .and(path("/enrollments/"))
            .and(header("authorization", format!("Bearer {}", new.access).as_str()))
            .and(body_json(json!({ "course": 3 })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 9 })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with_pair(&server, Some(&old));
        let created: Value = client.post("enrollments/", &json!({ "course": 3 })).await.unwrap();
        assert_eq!(created, json!({ "id": 9 }));
        assert_eq!(client.auth().store().get().unwrap().pair(), Some(new));
        assert!(client.auth().session().is_authenticated());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_refreshed_pair() {
        const REQUESTS: u64 = 10;

        let server = MockServer::start().await;
        let old = CredentialPair::new(access_token(1, "alice", -60), refresh_token("R1"));
        let new = CredentialPair::new(access_token(1, "alice", 3600), refresh_token("R2"));
        mount_refresh(&server, &old, &new, Duration::from_millis(150)).await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .and(header("authorization", format!("Bearer {}", new.access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(REQUESTS)
            .mount(&server)
            .await;

        let client = client_with_pair(&server, Some(&old));
        let results =
            futures::future::join_all((0..REQUESTS).map(|_| client.get::<Value>("courses/"))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_abandons_request() {
        let server = MockServer::start().await;
        let old = CredentialPair::new(access_token(1, "alice", -60), refresh_token("R1"));
        Mock::given(method("POST"))
            .and(path("/user/token/refresh/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "detail": "Token is invalid or expired"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_with_pair(&server, Some(&old));
        let err = client.get::<Value>("courses/").await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::Refresh(RefreshError::Rejected { status: 401, .. })
        ));
        assert_eq!(client.auth().store().get().unwrap().pair(), Some(old));
    }

    #[tokio::test]
    async fn test_rate_limit_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["ok"])))
            .mount(&server)
            .await;

        let client = client_with_pair(&server, None).with_initial_backoff(Duration::from_millis(5));
        let body: Value = client.get("courses/").await.unwrap();
        assert_eq!(body, json!(["ok"]));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/enrollments/9/"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_with_pair(&server, None).with_initial_backoff(Duration::from_millis(1));
        let err = client.delete("enrollments/9/").await.unwrap_err();
        assert!(matches!(err, RequestError::Api(ApiError::RateLimited)));
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            MAX_RATE_LIMIT_RETRIES as usize + 1
        );
    }

    #[tokio::test]
    async fn test_insecure_transport_withholds_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/courses/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let config = Config {
            base_url: server.uri(),
            allow_insecure_transport: false,
            ..Config::default()
        };
        let store = CredentialStore::in_memory();
        store
            .save(&CredentialPair::new(access_token(1, "alice", 3600), refresh_token("R1")))
            .unwrap();
        let client = ApiClient::new(&config, auth_manager(&config, store)).unwrap();

        let _: Value = client.get("courses/").await.unwrap();
        let requests = server.received_requests().await.unwrap();
        assert!(!has_auth_header(&requests[0]));
    }
}
