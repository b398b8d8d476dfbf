use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

pub const INDEX_FILENAME: &str = "index.json";

/// Manifest reads are retried this many times; the sync job may be mid-write.
const MANIFEST_READ_ATTEMPTS: u32 = 10;
const MANIFEST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One row of the build index: a reference on one target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "ref")]
    pub reference: String,
    pub target_platform: String,
    /// Location of the manifest; the pointer compared for build changes
    pub build_manifest: String,
    #[serde(default)]
    pub build_number: Option<u64>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexDocument {
    refs: Vec<IndexEntry>,
}

/// Metadata describing one installable build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    #[serde(rename = "ref")]
    pub reference: String,
    pub build_number: u64,
    pub target_platform: String,
    /// Build image name; also the install folder name
    pub build: String,
    /// Executable path relative to the install folder
    pub executable_path: String,
    #[serde(default)]
    pub archive: Option<String>,
}

impl BuildManifest {
    /// Absolute path of the executable once installed under `builds_dir`.
    pub fn executable(&self, builds_dir: &Path) -> PathBuf {
        builds_dir.join(&self.build).join(&self.executable_path)
    }

    pub fn is_installed(&self, builds_dir: &Path) -> bool {
        self.executable(builds_dir).exists()
    }

    /// The build name with its build number removed, lower-cased, with
    /// forward slashes. Matches every installed version of this reference.
    pub fn partial_build_path(&self) -> String {
        self.build
            .replace(&self.build_number.to_string(), "")
            .replace('\\', "/")
            .to_lowercase()
    }
}

/// Read-only view of the synced build index.
#[derive(Debug, Clone)]
pub struct BuildIndex {
    dir: PathBuf,
    platform: String,
    refs: Vec<IndexEntry>,
}

impl BuildIndex {
    /// Load `index.json` from `dir`, scoped to one target platform.
    pub fn load(dir: &Path, platform: &str) -> Result<Self> {
        let path = dir.join(INDEX_FILENAME);
        tracing::debug!(path = %path.display(), "Loading build index");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaemonError::IndexNotSynced(path));
            }
            Err(e) => return Err(e.into()),
        };
        let doc: IndexDocument = serde_json::from_str(&raw)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            platform: platform.to_string(),
            refs: doc.refs,
        })
    }

    /// Reload from the same folder.
    pub fn reload(&self) -> Result<Self> {
        Self::load(&self.dir, &self.platform)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.refs
    }

    /// The entry for `reference` on this index's platform.
    pub fn entry(&self, reference: &str) -> Option<&IndexEntry> {
        self.refs
            .iter()
            .find(|e| e.reference == reference && e.target_platform == self.platform)
    }

    /// The manifest pointer for `reference`; changes when a new build is published.
    pub fn manifest_pointer(&self, reference: &str) -> Option<&str> {
        self.entry(reference).map(|e| e.build_manifest.as_str())
    }

    /// Read the manifest file for `reference`.
    pub async fn manifest(&self, reference: &str) -> Result<BuildManifest> {
        let entry = self.entry(reference).ok_or_else(|| {
            tracing::warn!(reference, platform = %self.platform, "Ref not found in index file");
            DaemonError::BuildNotFound(reference.to_string())
        })?;
        let file_name = entry
            .build_manifest
            .rsplit('/')
            .next()
            .unwrap_or(&entry.build_manifest);
        let path = self.dir.join(file_name);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match read_manifest(&path) {
                Ok(manifest) => return Ok(manifest),
                Err(reason) if attempt < MANIFEST_READ_ATTEMPTS => {
                    tracing::info!(path = %path.display(), attempt, %reason, "Cannot read manifest, retrying");
                    tokio::time::sleep(MANIFEST_RETRY_DELAY).await;
                }
                Err(reason) => {
                    tracing::error!(path = %path.display(), %reason, "Unable to read manifest");
                    return Err(DaemonError::ManifestUnreadable { path, reason });
                }
            }
        }
    }
}

fn read_manifest(path: &Path) -> std::result::Result<BuildManifest, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}
