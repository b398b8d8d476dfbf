//! Structured event log.
//!
//! Events are appended as JSON lines to a file under the daemon log folder so
//! they can be collected and aggregated later. Context (reference, tenant,
//! command) is passed in explicitly instead of living in process globals.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const EVENT_LOG_FILENAME: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Who is emitting events.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub reference: Option<String>,
    pub tenant: Option<String>,
    pub command: Option<String>,
}

impl EventContext {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// One row in the event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub event: String,
    pub description: String,
    pub details: Value,
    pub tenant: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub cmd: Option<String>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Appends structured events to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    context: EventContext,
}

impl EventLog {
    pub fn new(log_dir: &Path, context: EventContext) -> Self {
        Self {
            path: log_dir.join(EVENT_LOG_FILENAME),
            context,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// Record an event using this log's context.
    pub fn record(&self, event: &str, description: impl Into<String>, severity: Severity) {
        self.record_with(event, description, Value::Null, severity, None);
    }

    /// Record an event with details, optionally overriding the context.
    pub fn record_with(
        &self,
        event: &str,
        description: impl Into<String>,
        details: Value,
        severity: Severity,
        context: Option<&EventContext>,
    ) {
        let ctx = context.unwrap_or(&self.context);
        let row = EventRecord {
            id: Uuid::new_v4(),
            event: event.to_string(),
            description: description.into(),
            details,
            tenant: ctx.tenant.clone().or_else(|| self.context.tenant.clone()),
            reference: ctx.reference.clone().or_else(|| self.context.reference.clone()),
            cmd: ctx.command.clone().or_else(|| self.context.command.clone()),
            severity,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.append(&row) {
            tracing::error!(event, path = %self.path.display(), error = %e, "Could not save event");
        }
    }

    fn append(&self, row: &EventRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }

    /// Read back every event in the log. Malformed lines are skipped.
    pub fn read_all(&self) -> std::io::Result<Vec<Value>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_log(dir: &Path) -> EventLog {
        EventLog::new(
            dir,
            EventContext::new("run")
                .with_reference("main")
                .with_tenant("acme"),
        )
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(dir.path());

        log.record("servers_added", "Added 2 servers", Severity::Info);
        log.record_with(
            "shutdown_servers",
            "Shutting down",
            json!({"reason": "kill"}),
            Severity::Warning,
            None,
        );

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "servers_added");
        assert_eq!(events[0]["severity"], "INFO");
        assert_eq!(events[0]["ref"], "main");
        assert_eq!(events[0]["tenant"], "acme");
        assert_eq!(events[0]["cmd"], "run");
        assert_eq!(events[1]["severity"], "WARNING");
        assert_eq!(events[1]["details"]["reason"], "kill");
    }

    #[test]
    fn context_override_keeps_missing_fields_from_log_context() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(dir.path());
        let other = EventContext::default().with_tenant("globex");

        log.record_with("processes_killed", "Killed 1", Value::Null, Severity::Warning, Some(&other));

        let events = log.read_all().unwrap();
        assert_eq!(events[0]["tenant"], "globex");
        assert_eq!(events[0]["ref"], "main");
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir.path().join("nowhere"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
