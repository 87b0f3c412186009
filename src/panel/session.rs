use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::db::entities::server;
use crate::db::enums::PanelKind;
use crate::panel::error::{AuthError, PanelError};

/// Name of the session cookie each panel brand sets on login.
pub fn session_cookie_name(kind: PanelKind) -> &'static str {
    match kind {
        PanelKind::Xui => "session",
        PanelKind::ThreeXui => "3x-ui",
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: String,
}

/// One authenticated HTTP client, 1:1 with a panel server. Construction does
/// no network I/O; the first authenticated request triggers `login()`.
/// The session token lives only in memory and is re-acquired after any
/// authentication failure.
pub struct PanelSession {
    server_id: i32,
    base_url: String,
    username: String,
    password: String,
    cookie_name: &'static str,
    client: Client,
    token: RwLock<Option<String>>,
}

impl PanelSession {
    pub fn new(server: &server::Model, timeout: Duration) -> Result<Self, PanelError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PanelError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            server_id: server.id,
            base_url: server.panel_base_url(),
            username: server.username.clone(),
            password: server.password.clone(),
            cookie_name: session_cookie_name(server.panel_kind),
            client,
            token: RwLock::new(None),
        })
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Authenticates and caches the panel's named session token.
    ///
    /// A success status with no token is its own failure kind: some panels
    /// answer HTTP 200 with a login page instead of rejecting outright.
    pub async fn login(&self) -> Result<String, PanelError> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(PanelError::from_reqwest)?;

        let status = response.status();
        let token = extract_session_cookie(response.headers(), self.cookie_name);
        let body: LoginBody = response
            .json()
            .await
            .map_err(|e| PanelError::Malformed(format!("login response: {e}")))?;

        if !status.is_success() || !body.success {
            return Err(AuthError::InvalidCredentials(if body.msg.is_empty() {
                format!("login rejected with status {status}")
            } else {
                body.msg
            })
            .into());
        }
        let token = token.ok_or(AuthError::AuthOkButNoToken)?;

        *self.token.write().await = Some(token.clone());
        debug!(server_id = self.server_id, "panel login succeeded");
        Ok(token)
    }

    pub async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// Sends an authenticated request and returns the parsed JSON body.
    /// An auth-rejected response invalidates the cached token and triggers
    /// exactly one re-login-and-retry; timeouts surface as transient errors.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, PanelError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retried = false;

        loop {
            let token = match self.token.read().await.clone() {
                Some(token) => token,
                None => self.login().await?,
            };

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(COOKIE, format!("{}={}", self.cookie_name, token));
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(PanelError::from_reqwest)?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                self.invalidate_token().await;
                if retried {
                    return Err(AuthError::InvalidCredentials(
                        "session rejected again after re-login".to_string(),
                    )
                    .into());
                }
                warn!(
                    server_id = self.server_id,
                    path = path,
                    "session token rejected, re-authenticating once"
                );
                retried = true;
                continue;
            }
            if !status.is_success() {
                return Err(PanelError::Malformed(format!(
                    "unexpected status {status} from {path}"
                )));
            }

            return response
                .json()
                .await
                .map_err(|e| PanelError::Malformed(format!("response from {path}: {e}")));
        }
    }
}

fn extract_session_cookie(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|raw| parse_set_cookie(raw, name))
}

/// Pulls `name=value` out of one Set-Cookie line.
fn parse_set_cookie(raw: &str, name: &str) -> Option<String> {
    let first = raw.split(';').next()?.trim();
    let (key, value) = first.split_once('=')?;
    if key.trim() == name && !value.is_empty() {
        Some(value.to_string())
    } else {
        None
    }
}

/// Explicitly owned cache of per-server sessions, injected where needed.
/// Sessions are never shared across servers; eviction handles credential
/// rotation.
pub struct SessionManager {
    sessions: DashMap<i32, Arc<PanelSession>>,
    request_timeout: Duration,
}

impl SessionManager {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            request_timeout,
        }
    }

    pub fn session_for(&self, server: &server::Model) -> Result<Arc<PanelSession>, PanelError> {
        if let Some(existing) = self.sessions.get(&server.id) {
            return Ok(existing.clone());
        }
        let session = Arc::new(PanelSession::new(server, self.request_timeout)?);
        self.sessions.insert(server.id, session.clone());
        Ok(session)
    }

    /// Drops the cached session (and its token) for a server.
    pub fn evict(&self, server_id: i32) {
        self.sessions.remove(&server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_extracts_named_token() {
        assert_eq!(
            parse_set_cookie("3x-ui=abc123; Path=/; HttpOnly", "3x-ui"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_set_cookie("session=tok; Max-Age=3600", "session"), Some("tok".into()));
        // A different cookie, or an empty value, is not a session token.
        assert_eq!(parse_set_cookie("lang=en; Path=/", "3x-ui"), None);
        assert_eq!(parse_set_cookie("3x-ui=; Path=/", "3x-ui"), None);
    }

    #[test]
    fn cookie_names_differ_per_brand() {
        assert_eq!(session_cookie_name(PanelKind::ThreeXui), "3x-ui");
        assert_eq!(session_cookie_name(PanelKind::Xui), "session");
    }

    #[test]
    fn missing_token_on_success_is_its_own_failure() {
        // HTTP 200 with a success body but no Set-Cookie: the error callers
        // see must be AuthOkButNoToken, not a credential rejection.
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(extract_session_cookie(&headers, "3x-ui"), None);
        let err: PanelError = AuthError::AuthOkButNoToken.into();
        assert!(err.is_auth());
        assert!(!err.is_transient());
    }
}
