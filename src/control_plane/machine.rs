use std::net::ToSocketAddrs;
use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;

use super::{ControlPlaneError, RestResource, Session};
use crate::config::MachineConfig;

/// What this machine reports about itself when registering.
#[derive(Debug, Clone, Serialize)]
pub struct MachineInfo {
    pub realm: String,
    pub instance_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

impl MachineInfo {
    /// Describe the local machine.
    pub fn local(config: &MachineConfig) -> Self {
        let instance_name = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        let private_ip = (instance_name.as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
            .map(|a| a.ip().to_string());

        Self {
            realm: "local".to_string(),
            instance_name,
            private_ip,
            group_name: config.group_name.clone(),
            public_ip: config.public_ip.clone(),
        }
    }
}

/// This machine's record on the control plane.
#[derive(Debug, Clone)]
pub struct MachineResource {
    resource: RestResource,
    record: Value,
}

impl MachineResource {
    /// Reuse a matching machine record if the control plane has one, otherwise create it.
    pub async fn get_or_create(
        session: Arc<Session>,
        info: &MachineInfo,
    ) -> Result<Self, ControlPlaneError> {
        let collection = session.endpoint("machines");
        let mut lookup = Url::parse(&collection).map_err(|e| ControlPlaneError::InvalidUrl {
            url: collection.clone(),
            reason: e.to_string(),
        })?;
        lookup
            .query_pairs_mut()
            .append_pair("rows", "1")
            .append_pair("realm", &info.realm)
            .append_pair("instance_name", &info.instance_name);

        let existing = match session
            .request(Method::GET, lookup.as_str(), None, &[StatusCode::OK])
            .await
        {
            Ok(response) => first_machine_url(&response.json(lookup.as_str())?),
            Err(ControlPlaneError::UnexpectedStatus { status, .. }) => {
                tracing::info!(status, "Machine lookup failed, creating a new machine resource");
                None
            }
            Err(e) => return Err(e),
        };

        let resource = match existing {
            Some(url) => RestResource::attach(session, url),
            None => {
                let body = serde_json::to_value(info).map_err(|e| ControlPlaneError::Decode {
                    url: collection.clone(),
                    reason: e.to_string(),
                })?;
                RestResource::create(session, &collection, &body).await?
            }
        };

        let record = resource.get().await?;
        tracing::info!(url = %resource.location(), "Using machine resource");
        Ok(Self { resource, record })
    }

    pub fn location(&self) -> &str {
        self.resource.location()
    }

    pub fn machine_id(&self) -> Value {
        self.record.get("machine_id").cloned().unwrap_or(Value::Null)
    }

    pub fn public_ip(&self) -> Option<String> {
        self.record
            .get("public_ip")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    }
}

/// Older records carry `uri` instead of `url`.
fn first_machine_url(listing: &Value) -> Option<String> {
    let first = listing.as_array()?.first()?;
    first
        .get("url")
        .or_else(|| first.get("uri"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_machine_url_prefers_url_then_uri() {
        assert_eq!(
            first_machine_url(&json!([{"url": "http://cp/machines/1", "uri": "old"}])).as_deref(),
            Some("http://cp/machines/1")
        );
        assert_eq!(
            first_machine_url(&json!([{"uri": "http://cp/machines/2"}])).as_deref(),
            Some("http://cp/machines/2")
        );
        assert!(first_machine_url(&json!([])).is_none());
        assert!(first_machine_url(&json!({"error": "nope"})).is_none());
    }

    #[test]
    fn local_machine_info_uses_config() {
        let info = MachineInfo::local(&MachineConfig {
            group_name: Some("eu".to_string()),
            public_ip: Some("203.0.113.9".to_string()),
        });
        assert_eq!(info.realm, "local");
        assert!(!info.instance_name.is_empty());
        assert_eq!(info.group_name.as_deref(), Some("eu"));
        assert_eq!(info.public_ip.as_deref(), Some("203.0.113.9"));
    }
}
