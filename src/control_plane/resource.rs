use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};
use serde_json::Value;

use super::{ControlPlaneError, Session};

/// One remote object at a URL.
#[derive(Debug, Clone)]
pub struct RestResource {
    session: Arc<Session>,
    location: String,
}

impl RestResource {
    /// POST `body` to a collection URL and bind to the created object.
    pub async fn create(
        session: Arc<Session>,
        url: &str,
        body: &Value,
    ) -> Result<Self, ControlPlaneError> {
        let response = session
            .request(Method::POST, url, Some(body), &[StatusCode::CREATED])
            .await?;
        let location = response
            .location
            .ok_or_else(|| ControlPlaneError::MissingLocation {
                url: url.to_string(),
            })?;
        let location = resolve_location(url, &location)?;
        tracing::debug!(url, location = %location, "Created remote resource");

        Ok(Self { session, location })
    }

    /// Bind to an existing object.
    pub fn attach(session: Arc<Session>, location: impl Into<String>) -> Self {
        Self {
            session,
            location: location.into(),
        }
    }

    /// Another resource on the same session.
    pub fn at(&self, location: impl Into<String>) -> Self {
        Self::attach(self.session.clone(), location)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn get(&self) -> Result<Value, ControlPlaneError> {
        self.call(Method::GET, None).await
    }

    pub async fn put(&self, body: &Value) -> Result<Value, ControlPlaneError> {
        self.call(Method::PUT, Some(body)).await
    }

    pub async fn patch(&self, body: &Value) -> Result<Value, ControlPlaneError> {
        self.call(Method::PATCH, Some(body)).await
    }

    async fn call(&self, method: Method, body: Option<&Value>) -> Result<Value, ControlPlaneError> {
        let response = self
            .session
            .request(method, &self.location, body, &[StatusCode::OK])
            .await?;
        response.json(&self.location)
    }
}

/// Locations may come back relative to the collection URL.
fn resolve_location(base: &str, location: &str) -> Result<String, ControlPlaneError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let base = Url::parse(base).map_err(|e| ControlPlaneError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    base.join(location)
        .map(|u| u.to_string())
        .map_err(|e| ControlPlaneError::InvalidUrl {
            url: location.to_string(),
            reason: e.to_string(),
        })
}
