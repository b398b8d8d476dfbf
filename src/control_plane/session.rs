use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::ControlPlaneError;
use crate::config::{ControlPlaneConfig, Credentials};

/// Header carrying the product API key.
pub const API_KEY_HEADER: &str = "Api-Key";

/// Marker the control plane puts in the body when the access token is rejected.
pub const INVALID_TOKEN_MARKER: &str = "Invalid JTI";

/// Which identity a token is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The supervisor itself
    Daemon,
    /// A worker process, handed the token on its command line
    Worker,
}

#[derive(Deserialize)]
struct AuthResponse {
    jti: String,
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: String,
}

impl ApiResponse {
    /// Parse the body as JSON. An empty body is `Value::Null`.
    pub fn json(&self, url: &str) -> Result<Value, ControlPlaneError> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| ControlPlaneError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Authenticated connection to the control plane.
///
/// Shared by every resource; a token refreshed by one resource is seen by all.
pub struct Session {
    http: reqwest::Client,
    config: ControlPlaneConfig,
    token: RwLock<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("root_endpoint", &self.config.root_endpoint)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the HTTP client and authenticate as the daemon.
    pub async fn connect(config: ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let session = Self {
            http,
            config,
            token: RwLock::new(String::new()),
        };
        session.reauthenticate().await?;
        tracing::info!(root_endpoint = %session.root_endpoint(), "Authenticated with control plane");
        Ok(session)
    }

    pub fn root_endpoint(&self) -> &str {
        self.config.root_endpoint.trim_end_matches('/')
    }

    /// Join a path onto the root endpoint.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.root_endpoint(), path.trim_start_matches('/'))
    }

    /// Current daemon access token.
    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Mint a new token for `role`.
    pub async fn issue_token(&self, role: Role) -> Result<String, ControlPlaneError> {
        let credentials: &Credentials = match role {
            Role::Daemon => &self.config.credentials,
            Role::Worker => self.config.worker_credentials(),
        };
        let url = self.endpoint("auth");
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(credentials)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ControlPlaneError::AuthRejected {
                status: status.as_u16(),
                body,
            });
        }

        let auth: AuthResponse =
            serde_json::from_str(&body).map_err(|e| ControlPlaneError::Decode {
                url,
                reason: e.to_string(),
            })?;
        Ok(auth.jti)
    }

    /// Fetch a fresh daemon token and use it for every subsequent request.
    pub async fn reauthenticate(&self) -> Result<(), ControlPlaneError> {
        let token = self.issue_token(Role::Daemon).await?;
        *self.token.write().await = token;
        Ok(())
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ControlPlaneError> {
        let token = self.token().await;
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(reqwest::header::AUTHORIZATION, format!("JTI {}", token))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(ApiResponse {
            status,
            location,
            body,
        })
    }

    /// Issue a request and check the status code against `expect`.
    ///
    /// A rejected token triggers one re-authentication and retry. A second
    /// rejection, or any other unexpected status, is returned as
    /// [`ControlPlaneError::UnexpectedStatus`].
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        expect: &[StatusCode],
    ) -> Result<ApiResponse, ControlPlaneError> {
        let mut retried = false;
        loop {
            tracing::debug!(method = %method, url, "Control plane request");
            let response = self.send(&method, url, body).await?;
            if expect.contains(&response.status) {
                return Ok(response);
            }

            if response.body.contains(INVALID_TOKEN_MARKER) {
                if !retried {
                    tracing::warn!(url, "Access token rejected, reauthenticating");
                    self.reauthenticate().await?;
                    retried = true;
                    continue;
                }
                tracing::error!(url, "Access token still rejected after reauthentication");
            }

            return Err(ControlPlaneError::UnexpectedStatus {
                method: method.to_string(),
                url: url.to_string(),
                status: response.status.as_u16(),
                body: response.body,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_session(root: &str) -> Session {
        Session {
            http: reqwest::Client::new(),
            config: ControlPlaneConfig {
                root_endpoint: root.to_string(),
                ..Default::default()
            },
            token: RwLock::new(String::new()),
        }
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let session = offline_session("http://cp.example.com/api/");
        assert_eq!(session.root_endpoint(), "http://cp.example.com/api");
        assert_eq!(session.endpoint("/servers"), "http://cp.example.com/api/servers");
        assert_eq!(session.endpoint("auth"), "http://cp.example.com/api/auth");
    }

    #[test]
    fn empty_body_parses_as_null() {
        let response = ApiResponse {
            status: StatusCode::OK,
            location: None,
            body: "  ".to_string(),
        };
        assert_eq!(response.json("http://x").unwrap(), Value::Null);
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let response = ApiResponse {
            status: StatusCode::OK,
            location: None,
            body: "{not json".to_string(),
        };
        let err = response.json("http://x/servers/1").unwrap_err();
        assert!(matches!(err, ControlPlaneError::Decode { .. }));
    }
}
