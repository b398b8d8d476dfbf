use super::BuildIndex;

/// A manifest pointer that moved since the supervisor started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChange {
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// Remembers the manifest pointer seen at loop start and reports when a
/// freshly loaded index disagrees with it.
///
/// Comparing against the baseline (not the last observation) keeps detection
/// idempotent: an unchanged pointer never reports, a changed one reports on
/// every observation until the caller acts on it.
#[derive(Debug, Clone)]
pub struct BuildWatch {
    reference: String,
    baseline: Option<String>,
}

impl BuildWatch {
    pub fn new(reference: &str, index: &BuildIndex) -> Self {
        Self {
            reference: reference.to_string(),
            baseline: index.manifest_pointer(reference).map(str::to_string),
        }
    }

    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }

    pub fn observe(&self, index: &BuildIndex) -> Option<BuildChange> {
        let current = index.manifest_pointer(&self.reference);
        if current == self.baseline.as_deref() {
            return None;
        }
        Some(BuildChange {
            previous: self.baseline.clone(),
            current: current.map(str::to_string),
        })
    }
}
