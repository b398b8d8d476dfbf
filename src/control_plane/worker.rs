use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{ControlPlaneError, RestResource, Session};

/// Status of a worker as recorded by the control plane.
///
/// The worker process itself moves its record to `running`; the supervisor
/// writes the other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Pending,
    Starting,
    Running,
    AbnormalExit,
    Killed,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Pending => "pending",
            RemoteStatus::Starting => "starting",
            RemoteStatus::Running => "running",
            RemoteStatus::AbnormalExit => "abnormalexit",
            RemoteStatus::Killed => "killed",
            RemoteStatus::Unknown => "unknown",
        }
    }

    /// The supervisor still owns the record and may overwrite the status.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Pending | RemoteStatus::Starting | RemoteStatus::Running
        )
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command queued for a worker by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PendingCommand {
    pub command: String,
    pub url: String,
}

impl PendingCommand {
    pub fn is_kill(&self) -> bool {
        self.command == "kill"
    }
}

/// The fields of a remote worker record the supervisor reads.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRecord {
    #[serde(default)]
    pub server_id: Option<Value>,
    #[serde(default)]
    pub token: Option<String>,
    pub status: RemoteStatus,
    #[serde(default)]
    pub pending_commands: Vec<PendingCommand>,
    #[serde(default)]
    pub heartbeat_date: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl WorkerRecord {
    /// Server id rendered for file names; numbers and strings are both accepted.
    pub fn server_id(&self) -> Option<String> {
        match self.server_id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Desired metadata recorded before a worker process is started.
#[derive(Debug, Clone, Serialize)]
pub struct NewWorker {
    pub status: RemoteStatus,
    pub image_name: String,
    pub command_line: String,
    pub command_line_custom: String,
    pub machine_id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    pub port: u16,
}

/// A worker's record on the control plane, with its last fetched state cached.
#[derive(Debug, Clone)]
pub struct WorkerResource {
    resource: RestResource,
    record: WorkerRecord,
}

impl WorkerResource {
    /// Create a worker record under `<root>/servers`.
    pub async fn create(session: Arc<Session>, info: &NewWorker) -> Result<Self, ControlPlaneError> {
        let url = session.endpoint("servers");
        let body = serde_json::to_value(info).map_err(|e| ControlPlaneError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let resource = RestResource::create(session, &url, &body).await?;
        Self::attach(resource).await
    }

    /// Bind to an existing worker record and fetch it.
    pub async fn attach(resource: RestResource) -> Result<Self, ControlPlaneError> {
        let record = fetch_record(&resource).await?;
        Ok(Self { resource, record })
    }

    pub fn location(&self) -> &str {
        self.resource.location()
    }

    /// The record as of the last fetch or write.
    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }

    pub fn cached_status(&self) -> RemoteStatus {
        self.record.status
    }

    /// Re-read the whole record.
    pub async fn refresh(&mut self) -> Result<&WorkerRecord, ControlPlaneError> {
        self.record = fetch_record(&self.resource).await?;
        Ok(&self.record)
    }

    /// Re-read the record and return its status.
    pub async fn status(&mut self) -> Result<RemoteStatus, ControlPlaneError> {
        Ok(self.refresh().await?.status)
    }

    /// PUT fields onto the record, keeping the cached status in step.
    pub async fn put(&mut self, fields: &Value) -> Result<(), ControlPlaneError> {
        self.resource.put(fields).await?;
        if let Some(status) = fields
            .get("status")
            .and_then(|s| serde_json::from_value::<RemoteStatus>(s.clone()).ok())
        {
            self.record.status = status;
        }
        Ok(())
    }

    /// Set the status, merging `details` into the remote details object.
    pub async fn set_status(
        &mut self,
        status: RemoteStatus,
        details: Value,
    ) -> Result<(), ControlPlaneError> {
        let mut merged = self.refresh().await?.details.clone();
        if let Value::Object(new) = details {
            merged.extend(new);
        }
        tracing::info!(url = %self.location(), status = %status, "Setting worker status");
        self.put(&json!({"status": status, "details": merged})).await?;
        self.record.details = merged;
        Ok(())
    }

    /// Tell the control plane a pending command is being handled.
    pub async fn acknowledge(&self, command: &PendingCommand) -> Result<(), ControlPlaneError> {
        self.resource
            .at(command.url.clone())
            .patch(&json!({"status": "running"}))
            .await?;
        Ok(())
    }
}

async fn fetch_record(resource: &RestResource) -> Result<WorkerRecord, ControlPlaneError> {
    let value = resource.get().await?;
    serde_json::from_value(value).map_err(|e| ControlPlaneError::Decode {
        url: resource.location().to_string(),
        reason: e.to_string(),
    })
}

/// Details payload carrying a human-readable reason for a status change.
pub fn status_reason(reason: &str) -> Value {
    json!({ "status-reason": reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_round_trips_through_lowercase_names() {
        let status: RemoteStatus = serde_json::from_str("\"abnormalexit\"").unwrap();
        assert_eq!(status, RemoteStatus::AbnormalExit);
        assert_eq!(serde_json::to_string(&RemoteStatus::Killed).unwrap(), "\"killed\"");
        assert_eq!(RemoteStatus::Running.to_string(), "running");
    }

    #[test]
    fn unknown_remote_status_is_tolerated() {
        let status: RemoteStatus = serde_json::from_str("\"popen failed\"").unwrap();
        assert_eq!(status, RemoteStatus::Unknown);
        assert!(!status.is_live());
    }

    #[test]
    fn worker_record_with_commands_and_heartbeat() {
        let record: WorkerRecord = serde_json::from_value(json!({
            "server_id": 42,
            "token": "abc",
            "status": "running",
            "pending_commands": [{"command": "kill", "url": "http://cp/commands/1"}],
            "heartbeat_date": "2026-01-01T00:00:00Z",
            "details": {"ref": "main"},
            "port": 7777
        }))
        .unwrap();

        assert_eq!(record.server_id().as_deref(), Some("42"));
        assert_eq!(record.status, RemoteStatus::Running);
        assert_eq!(record.pending_commands.len(), 1);
        assert!(record.pending_commands[0].is_kill());
        assert_eq!(record.details["ref"], "main");
    }

    #[test]
    fn minimal_worker_record() {
        let record: WorkerRecord =
            serde_json::from_value(json!({"status": "pending", "server_id": "srv-9"})).unwrap();
        assert_eq!(record.server_id().as_deref(), Some("srv-9"));
        assert!(record.pending_commands.is_empty());
        assert!(record.heartbeat_date.is_none());
    }

    #[test]
    fn new_worker_omits_missing_public_ip() {
        let info = NewWorker {
            status: RemoteStatus::Pending,
            image_name: "game.main.12".to_string(),
            command_line: "/builds/game.main.12/Server.exe -log".to_string(),
            command_line_custom: "-log".to_string(),
            machine_id: json!(3),
            public_ip: None,
            port: 7777,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["status"], "pending");
        assert!(value.get("public_ip").is_none());
        assert_eq!(value["port"], 7777);
    }
}
