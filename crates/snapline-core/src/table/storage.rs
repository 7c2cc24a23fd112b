//! Table storage on top of `object_store`.
//!
//! All paths are relative to the table root. Layout:
//!
//! ```text
//! metadata/v00000000000000000007.metadata.json   table metadata, one per version
//! metadata/version-hint.text                     advisory latest version
//! metadata/<snapshot>-<uuid>-m<n>.manifest.json  manifests
//! metadata/snap-<snapshot>-<uuid>.json           manifest lists
//! metadata/stats-<snapshot>-<uuid>.json          partition statistics
//! data/...                                       data files (written upstream)
//! ```
//!
//! Every file is written at most once. The metadata pointer swap is the
//! create-if-absent of `v{N+1}.metadata.json`: whoever creates it first owns
//! version N+1, every other writer observes `AlreadyExists` and has lost the
//! race.

use crate::model::{Manifest, ManifestList, PartitionStats, TableMetadata};
use crate::{CommitError, Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory holding metadata, manifests, manifest lists and statistics.
pub const METADATA_DIR: &str = "metadata";
/// Directory holding data files.
pub const DATA_DIR: &str = "data";
/// Advisory pointer to the latest metadata version.
pub const VERSION_HINT: &str = "metadata/version-hint.text";
const METADATA_SUFFIX: &str = ".metadata.json";

/// A file listed from table storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Path relative to the table root
    pub path: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

/// Handle to one table's files.
#[derive(Debug, Clone)]
pub struct TableStore {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl TableStore {
    /// Wrap an existing object store rooted at the table location.
    pub fn new(store: Arc<dyn ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    /// Open a table location.
    ///
    /// `memory://...` opens a fresh in-memory store; anything else is treated
    /// as a local directory, with an optional `file://` scheme.
    pub fn open(location: &str) -> Result<Self> {
        if location.starts_with("memory://") {
            return Ok(Self::new(Arc::new(InMemory::new()), location));
        }

        let dir = location.strip_prefix("file://").unwrap_or(location);
        std::fs::create_dir_all(dir)?;
        let store = LocalFileSystem::new_with_prefix(dir)?;
        Ok(Self::new(Arc::new(store), location))
    }

    /// Table location.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Underlying object store.
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    // ===== Metadata versions =====

    /// Path of the metadata file for `version`.
    pub fn metadata_path(version: u64) -> String {
        format!("{}/v{:020}{}", METADATA_DIR, version, METADATA_SUFFIX)
    }

    /// Parse a metadata version out of a metadata file path.
    pub fn parse_metadata_version(path: &str) -> Option<u64> {
        let name = path.rsplit('/').next()?;
        name.strip_prefix('v')?
            .strip_suffix(METADATA_SUFFIX)?
            .parse()
            .ok()
    }

    /// Create a new table. Fails if any metadata version already exists.
    pub async fn create_table(&self, metadata: &TableMetadata) -> Result<()> {
        if self.current_version().await? > 0 {
            return Err(Error::Config(format!(
                "table already exists at {}",
                self.location
            )));
        }
        self.publish_metadata(metadata).await
    }

    /// Whether any metadata version exists.
    pub async fn table_exists(&self) -> Result<bool> {
        Ok(self.current_version().await? > 0)
    }

    /// Latest published metadata version, 0 when the table does not exist.
    ///
    /// The version hint is only a starting point; the result is confirmed by
    /// probing forward until a version is missing.
    pub async fn current_version(&self) -> Result<u64> {
        let mut version = match self.read_version_hint().await? {
            Some(hint) => hint,
            None => self.list_metadata_versions().await?.last().copied().unwrap_or(0),
        };

        loop {
            match self.store.head(&Path::from(Self::metadata_path(version + 1))).await {
                Ok(_) => version += 1,
                Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(version)
    }

    /// Load the latest published metadata.
    pub async fn load_metadata(&self) -> Result<TableMetadata> {
        let version = self.current_version().await?;
        if version == 0 {
            return Err(Error::NotFound(format!(
                "no table metadata at {}",
                self.location
            )));
        }
        self.read_metadata_version(version).await
    }

    /// Load a specific metadata version.
    pub async fn read_metadata_version(&self, version: u64) -> Result<TableMetadata> {
        self.read_json(&Self::metadata_path(version)).await
    }

    /// Publish `metadata` as its `metadata_version`.
    ///
    /// Returns [`CommitError::CasConflict`] when another writer already
    /// created that version.
    pub async fn publish_metadata(&self, metadata: &TableMetadata) -> Result<()> {
        let version = metadata.metadata_version;
        let path = Self::metadata_path(version);

        match self.put_new(&path, serde_json::to_vec_pretty(metadata)?).await {
            Ok(()) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!(version = version, "Metadata version already exists");
                return Err(CommitError::CasConflict {
                    expected: version.saturating_sub(1),
                    actual: version,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        // Advisory only; readers confirm by probing.
        if let Err(e) = self
            .store
            .put(&Path::from(VERSION_HINT), PutPayload::from(version.to_string()))
            .await
        {
            warn!(version = version, error = %e, "Failed to update version hint");
        }

        debug!(version = version, path = %path, "Published table metadata");
        Ok(())
    }

    /// All metadata versions present, ascending.
    pub async fn list_metadata_versions(&self) -> Result<Vec<u64>> {
        let mut versions: Vec<u64> = self
            .list(Some(METADATA_DIR))
            .await?
            .iter()
            .filter_map(|f| Self::parse_metadata_version(&f.path))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_version_hint(&self) -> Result<Option<u64>> {
        match self.store.get(&Path::from(VERSION_HINT)).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.trim().parse().ok()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ===== Manifests, manifest lists, statistics =====

    /// Write a manifest produced by snapshot `snapshot_id`.
    pub async fn write_manifest(
        &self,
        snapshot_id: i64,
        index: usize,
        manifest: &Manifest,
    ) -> Result<String> {
        let path = format!(
            "{}/{}-{}-m{}.manifest.json",
            METADATA_DIR,
            snapshot_id,
            Uuid::new_v4(),
            index
        );
        self.write_json(&path, manifest).await?;
        Ok(path)
    }

    /// Read a manifest.
    pub async fn read_manifest(&self, path: &str) -> Result<Manifest> {
        self.read_json(path).await
    }

    /// Write a manifest list.
    pub async fn write_manifest_list(&self, list: &ManifestList) -> Result<String> {
        let path = format!(
            "{}/snap-{}-{}.json",
            METADATA_DIR,
            list.snapshot_id,
            Uuid::new_v4()
        );
        self.write_json(&path, list).await?;
        Ok(path)
    }

    /// Read a manifest list.
    pub async fn read_manifest_list(&self, path: &str) -> Result<ManifestList> {
        self.read_json(path).await
    }

    /// Write partition statistics.
    pub async fn write_partition_stats(&self, stats: &PartitionStats) -> Result<String> {
        let path = format!(
            "{}/stats-{}-{}.json",
            METADATA_DIR,
            stats.snapshot_id,
            Uuid::new_v4()
        );
        self.write_json(&path, stats).await?;
        Ok(path)
    }

    /// Read partition statistics.
    pub async fn read_partition_stats(&self, path: &str) -> Result<PartitionStats> {
        self.read_json(path).await
    }

    // ===== Generic file operations =====

    /// Write raw bytes to a new file.
    pub async fn write_bytes(&self, path: &str, data: impl Into<Bytes>) -> Result<()> {
        self.put_new(path, data.into()).await.map_err(Error::from)
    }

    /// Whether a file exists.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&Path::from(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file. A missing file surfaces as [`Error::NotFound`].
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(&Path::from(path)).await?;
        Ok(())
    }

    /// List files under an optional prefix.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredFile>> {
        let prefix = prefix.map(Path::from);
        self.store
            .list(prefix.as_ref())
            .map_ok(|meta| StoredFile {
                path: meta.location.to_string(),
                size_bytes: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .try_collect()
            .await
            .map_err(|e| Error::Storage(format!("Failed to list files: {}", e)))
    }

    async fn put_new(&self, path: &str, data: impl Into<PutPayload>) -> object_store::Result<()> {
        self.store
            .put_opts(&Path::from(path), data.into(), PutMode::Create.into())
            .await
            .map(|_| ())
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.put_new(path, data).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.store.get(&Path::from(path)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
