use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{DaemonError, Result};

/// Where the supervisor learns how many workers it should be running.
///
/// Read on every tick; the supervisor only observes the value.
pub trait CapacitySource: Send + Sync {
    fn desired(&self, reference: &str, tenant: &str) -> Result<usize>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRow {
    #[serde(rename = "ref")]
    pub reference: String,
    pub tenant: String,
    pub processes_per_machine: usize,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct InstanceDocument {
    instances: Vec<InstanceRow>,
}

/// Desired capacity table stored as a JSON file on this machine.
#[derive(Debug, Clone)]
pub struct InstanceTable {
    path: PathBuf,
}

impl InstanceTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every row in the table.
    pub fn rows(&self) -> Result<Vec<InstanceRow>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            DaemonError::Config(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let doc: InstanceDocument = serde_json::from_str(&raw)?;
        Ok(doc.instances)
    }
}

impl CapacitySource for InstanceTable {
    fn desired(&self, reference: &str, tenant: &str) -> Result<usize> {
        let row = self
            .rows()?
            .into_iter()
            .find(|r| r.reference == reference && r.tenant == tenant)
            .ok_or_else(|| DaemonError::NotRegistered {
                reference: reference.to_string(),
                tenant: tenant.to_string(),
            })?;

        if !row.enabled {
            tracing::warn!(reference, tenant, "Instance row is disabled, running zero processes");
            return Ok(0);
        }
        Ok(row.processes_per_machine)
    }
}

/// In-memory capacity that can be changed from another task.
#[derive(Debug, Clone, Default)]
pub struct SharedCapacity(Arc<AtomicUsize>);

impl SharedCapacity {
    pub fn new(initial: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(initial)))
    }

    pub fn set(&self, desired: usize) {
        self.0.store(desired, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl CapacitySource for SharedCapacity {
    fn desired(&self, _reference: &str, _tenant: &str) -> Result<usize> {
        Ok(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(contents: &str) -> (tempfile::TempDir, InstanceTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, contents).unwrap();
        (dir, InstanceTable::new(path))
    }

    #[test]
    fn desired_capacity_for_registered_pair() {
        let (_dir, table) = table(
            r#"{"instances": [
                {"ref": "main", "tenant": "acme", "processes_per_machine": 3},
                {"ref": "main", "tenant": "globex", "processes_per_machine": 1}
            ]}"#,
        );
        assert_eq!(table.desired("main", "acme").unwrap(), 3);
        assert_eq!(table.desired("main", "globex").unwrap(), 1);
    }

    #[test]
    fn disabled_row_means_zero() {
        let (_dir, table) = table(
            r#"{"instances": [{"ref": "main", "tenant": "acme", "processes_per_machine": 3, "enabled": false}]}"#,
        );
        assert_eq!(table.desired("main", "acme").unwrap(), 0);
    }

    #[test]
    fn unregistered_pair_is_an_error() {
        let (_dir, table) = table(r#"{"instances": []}"#);
        let err = table.desired("main", "acme").unwrap_err();
        assert!(matches!(err, DaemonError::NotRegistered { .. }));
    }

    #[test]
    fn table_is_re_read_on_every_call() {
        let (_dir, table) = table(
            r#"{"instances": [{"ref": "main", "tenant": "acme", "processes_per_machine": 1}]}"#,
        );
        assert_eq!(table.desired("main", "acme").unwrap(), 1);
        std::fs::write(
            table.path(),
            r#"{"instances": [{"ref": "main", "tenant": "acme", "processes_per_machine": 4}]}"#,
        )
        .unwrap();
        assert_eq!(table.desired("main", "acme").unwrap(), 4);
    }

    #[test]
    fn shared_capacity_is_visible_through_clones() {
        let capacity = SharedCapacity::new(0);
        let handle = capacity.clone();
        handle.set(2);
        assert_eq!(capacity.desired("any", "any").unwrap(), 2);
    }
}
