//! API client for the civic portal REST backend.
//!
//! Every request goes through `ApiClient::request`, which attaches the
//! current bearer token and treats a 401 response as the authoritative end
//! of the session.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::SessionManager;
use crate::models::UserRecord;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Route the client is sent to when the server rejects the session
pub const LOGIN_ROUTE: &str = "/login";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Where to send the user when the session ends.
pub trait Navigator: Send + Sync {
    fn redirect(&self, route: &str);
}

/// Navigator for headless use. Only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn redirect(&self, route: &str) {
        debug!(route = route, "Redirect requested");
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    user: UserRecord,
    /// Server-declared lifetime such as "1d"
    #[serde(default)]
    expires_in: Option<String>,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionManager>,
    navigator: Arc<dyn Navigator>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        session: Arc<SessionManager>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            navigator,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff delay; later retries double it.
    pub fn with_retry_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.session.get_token() {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Server said the session is no longer valid, whatever the local clock thinks.
    fn end_session(&self) {
        warn!("Server rejected session, logging out");
        self.session.clear_auth();
        self.navigator.redirect(LOGIN_ROUTE);
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit
    /// (should retry), or Err for other errors.
    async fn check_response_for_retry(&self, response: Response) -> Result<Option<Response>, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(Some(response))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            self.end_session();
            Err(ApiError::Unauthorized)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send an authenticated request.
    ///
    /// A 401 clears the stored session, redirects to the login route and
    /// fails with `ApiError::Unauthorized`.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .headers(self.auth_headers()?);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;

            match self.check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request::<()>(Method::GET, path, None).await?;
        Self::parse_json(response).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.request(Method::POST, path, Some(body)).await?;
        Self::parse_json(response).await
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    // ===== Authentication =====

    /// Log in and store the returned token and user.
    ///
    /// `lifetime` is used unless the server declares its own `expiresIn`.
    /// A 401 here means bad credentials and does not redirect.
    pub async fn login(&self, identifier: &str, password: &str, lifetime: &str) -> Result<UserRecord, ApiError> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { identifier, password })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let login: LoginResponse = Self::parse_json(response).await?;
        let lifetime = login.expires_in.as_deref().unwrap_or(lifetime);
        let expires_at = self.session.try_set_session(&login.token, lifetime, &login.user)?;

        info!(user = %login.user.id, role = ?login.user.role, %expires_at, "Login successful");
        Ok(login.user)
    }

    /// Clear the local session and tell the server, best effort.
    pub async fn logout(&self) {
        if let Some(token) = self.session.get_token() {
            let result = self
                .client
                .post(self.url("/auth/logout"))
                .bearer_auth(token)
                .send()
                .await;
            if let Err(e) = result {
                debug!(error = %e, "Logout notification failed");
            }
        }
        self.session.clear_auth();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use crate::auth::SessionStore;
    use crate::models::Role;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct RecordingNavigator {
        routes: Mutex<Vec<String>>,
    }

    impl Navigator for RecordingNavigator {
        fn redirect(&self, route: &str) {
            self.routes.lock().unwrap().push(route.to_string());
        }
    }

    /// Read one HTTP request including its body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        String::from_utf8_lossy(&request).to_string()
    }

    /// Serve the given responses in order, one connection each, and hand
    /// back the raw requests.
    async fn serve_sequence(responses: Vec<(&'static str, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            requests
        });

        (base, handle)
    }

    /// Serve exactly one HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let (base, handle) = serve_sequence(vec![(status, body)]).await;
        let handle = tokio::spawn(async move { handle.await.unwrap().remove(0) });
        (base, handle)
    }

    /// Store that refuses every write
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl SessionStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, crate::auth::StoreError> {
            self.inner.get(key)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), crate::auth::StoreError> {
            Err(crate::auth::StoreError::Unavailable("quota exceeded".into()))
        }
        fn remove(&self, key: &str) -> Result<(), crate::auth::StoreError> {
            self.inner.remove(key)
        }
    }

    fn client(base: &str) -> (ApiClient, Arc<MemoryStore>, Arc<RecordingNavigator>) {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionManager::new(store.clone()));
        let navigator = Arc::new(RecordingNavigator::default());
        let client = ApiClient::new(base, session, navigator.clone())
            .unwrap()
            .with_retry_backoff(Duration::from_millis(1));
        (client, store, navigator)
    }

    #[tokio::test]
    async fn test_unauthorized_clears_session_and_redirects() {
        let (base, server) = serve_once("401 Unauthorized", r#"{"message":"jwt expired"}"#).await;
        let (client, store, navigator) = client(&base);
        client.session().set_token("tok", "1d");
        client.session().set_user(&UserRecord::new("1", "Ravi", Role::Citizen));

        let result = client.get_json::<serde_json::Value>("/grievances/mine").await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert!(store.is_empty());
        assert_eq!(*navigator.routes.lock().unwrap(), vec!["/login".to_string()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bearer_header_attached() {
        let (base, server) = serve_once("200 OK", r#"{"count":3}"#).await;
        let (client, _store, navigator) = client(&base);
        client.session().set_token("secret-token", "2h");

        let value: serde_json::Value = client.get_json("/welfare/schemes").await.unwrap();
        assert_eq!(value["count"], 3);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /welfare/schemes "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
        assert!(navigator.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_header_without_session() {
        let (base, server) = serve_once("200 OK", "[]").await;
        let (client, _store, _navigator) = client(&base);

        let value: Vec<serde_json::Value> = client.get_json("wards").await.unwrap();
        assert!(value.is_empty());

        let request = server.await.unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_server_error_keeps_session() {
        let (base, server) = serve_once("500 Internal Server Error", "boom").await;
        let (client, store, _navigator) = client(&base);
        client.session().set_token("tok", "1d");

        let result = client.get_json::<serde_json::Value>("/admin/stats").await;
        assert!(matches!(result, Err(ApiError::ServerError(b)) if b == "boom"));
        assert!(!store.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_stores_token_and_user() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"token":"new-token","expiresIn":"2h","user":{"_id":"u7","name":"Meena","role":"officer","ward":"4"}}"#,
        )
        .await;
        let (client, store, _navigator) = client(&base);

        let user = client.login("meena@example.org", "pw", "1d").await.unwrap();
        assert_eq!(user.role, Role::Officer);

        let session = client.session();
        assert_eq!(session.get_token().as_deref(), Some("new-token"));
        assert_eq!(session.get_user().map(|u| u.id), Some("u7".to_string()));
        let remaining = session.time_until_expiry();
        assert!(remaining <= chrono::Duration::hours(2));
        assert!(remaining > chrono::Duration::hours(2) - chrono::Duration::seconds(30));
        assert!(store.get(crate::auth::session::SESSION_KEY).unwrap().is_some());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /auth/login "));
        assert!(request.contains(r#""identifier":"meena@example.org""#));
    }

    #[tokio::test]
    async fn test_login_bad_credentials_does_not_redirect() {
        let (base, server) = serve_once("401 Unauthorized", r#"{"message":"bad password"}"#).await;
        let (client, _store, navigator) = client(&base);

        let result = client.login("ravi", "wrong", "1d").await;
        assert!(matches!(result, Err(ApiError::InvalidCredentials)));
        assert!(navigator.routes.lock().unwrap().is_empty());
        assert_eq!(client.session().get_token(), None);
        server.await.unwrap();
    }

    #[test]
    fn test_url_joining() {
        let (client, _store, _navigator) = client("http://portal.test/api/");
        assert_eq!(client.url("/grievances"), "http://portal.test/api/grievances");
        assert_eq!(client.url("grievances"), "http://portal.test/api/grievances");
        assert_eq!(client.url("https://tiles.test/x"), "https://tiles.test/x");
    }

    #[tokio::test]
    async fn test_login_store_failure_leaves_no_partial_session() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"token":"tok","user":{"id":"u1","name":"Ravi","role":"citizen"}}"#,
        )
        .await;
        let store = Arc::new(ReadOnlyStore::default());
        let session = Arc::new(SessionManager::new(store.clone()));
        let client = ApiClient::new(&base, session, Arc::new(NoopNavigator)).unwrap();

        let result = client.login("ravi", "pw", "1d").await;
        assert!(matches!(result, Err(ApiError::Session(_))));
        assert_eq!(client.session().get_token(), None);
        assert_eq!(client.session().get_user(), None);
        assert!(store.inner.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_succeeds() {
        let (base, server) = serve_sequence(vec![
            ("429 Too Many Requests", ""),
            ("200 OK", r#"{"ok":true}"#),
        ])
        .await;
        let (client, _store, _navigator) = client(&base);
        client.session().set_token("tok", "1d");

        let value: serde_json::Value = client.get_json("/grievances").await.unwrap();
        assert_eq!(value["ok"], true);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r.to_ascii_lowercase().contains("authorization: bearer tok")));
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_retries() {
        let (base, server) = serve_sequence(vec![
            ("429 Too Many Requests", ""),
            ("429 Too Many Requests", ""),
            ("429 Too Many Requests", ""),
            ("429 Too Many Requests", ""),
        ])
        .await;
        let (client, store, navigator) = client(&base);
        client.session().set_token("tok", "1d");

        let result = client.get_json::<serde_json::Value>("/grievances").await;
        assert!(matches!(result, Err(ApiError::RateLimited)));
        assert_eq!(server.await.unwrap().len(), 4);
        // Rate limiting is not a session failure
        assert!(!store.is_empty());
        assert!(navigator.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logout_notifies_server_and_clears() {
        let (base, server) = serve_once("200 OK", "{}").await;
        let (client, store, _navigator) = client(&base);
        client.session().set_token("tok", "1d");
        client.session().set_user(&UserRecord::new("1", "Ravi", Role::Citizen));

        client.logout().await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /auth/logout "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_logout_clears_when_server_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let (client, store, _navigator) = client(&base);
        client.session().set_token("tok", "1d");

        client.logout().await;
        assert!(store.is_empty());
    }
}
