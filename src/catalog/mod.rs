//! Metadata catalog: the durable record of every backup.
//!
//! One JSON file per descriptor under a catalog root. Writes go through a
//! `<id>.json.tmp` + fsync + rename sequence, so a crash mid-write leaves
//! no partially-written record and concurrent readers only ever observe
//! complete descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::codec::CodecSpec;
use crate::engine::EngineKind;
use crate::error::{BackupError, ErrorKind, Result};
use crate::validation::validate_backup_id;

/// Per-table (or per-collection) figures captured at dump time. Sizes are
/// engine-native: relational engines report data/index lengths, the
/// document engine reports uncompressed collection size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub data_bytes: u64,
    #[serde(default)]
    pub index_bytes: u64,
}

/// Where an artifact's bytes live. Opaque to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocator {
    pub provider: String,
    pub path: String,
}

/// Descriptor lifecycle. `pending → in_progress → success | failed`; no
/// other transitions, and nothing mutates a terminal descriptor except
/// deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

/// Structured failure recorded on a failed descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Free-form context, e.g. a subprocess stderr tail or an orphaned
    /// storage locator awaiting operator cleanup.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// The catalog's primary record. Immutable once `status` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub engine_kind: EngineKind,
    #[serde(default)]
    pub engine_version: String,
    pub databases: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableInfo>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw_size: u64,
    #[serde(default)]
    pub stored_size: u64,
    pub codec: CodecSpec,
    #[serde(default)]
    pub checksum: String,
    pub storage_locator: StorageLocator,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackupFailure>,
    /// Set when a delete removed the record's blobs only partially; the
    /// orphaned bytes still need operator cleanup.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deletion_pending: bool,
    /// Unknown fields from newer writers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Sort key for catalog listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    StartedAt,
    RawSize,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Conjunction of listing predicates; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub database: Option<String>,
    pub engine_kind: Option<EngineKind>,
    pub storage_provider: Option<String>,
    /// Inclusive lower bound on `started_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `started_at`.
    pub to: Option<DateTime<Utc>>,
    /// Every filter tag must be present with a matching value.
    pub tags: BTreeMap<String, String>,
    pub sort: SortKey,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl CatalogFilter {
    fn matches(&self, desc: &BackupDescriptor) -> bool {
        if let Some(db) = &self.database {
            if !desc.databases.iter().any(|d| d == db) {
                return false;
            }
        }
        if let Some(kind) = self.engine_kind {
            if desc.engine_kind != kind {
                return false;
            }
        }
        if let Some(provider) = &self.storage_provider {
            if &desc.storage_locator.provider != provider {
                return false;
            }
        }
        if let Some(from) = self.from {
            if desc.started_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if desc.started_at > to {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| desc.tags.get(k) == Some(v))
    }

    fn sort(&self, descriptors: &mut [BackupDescriptor]) {
        descriptors.sort_by(|a, b| {
            let primary = match self.sort {
                SortKey::StartedAt => a.started_at.cmp(&b.started_at),
                SortKey::RawSize => a.raw_size.cmp(&b.raw_size),
                SortKey::Name => a.name.cmp(&b.name),
            };
            let primary = match self.order {
                SortOrder::Asc => primary,
                SortOrder::Desc => primary.reverse(),
            };
            // Total order: ties always break by id ascending.
            primary.then_with(|| a.id.cmp(&b.id))
        });
    }
}

/// File-backed catalog. Readers never block each other; writers to the same
/// id are serialized by the atomic rename, writers to distinct ids proceed
/// in parallel.
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn catalog_err(context: &str, e: impl std::fmt::Display) -> BackupError {
        BackupError::Catalog(format!("{context}: {e}"))
    }

    /// Persist a descriptor, atomically replacing any previous version.
    pub async fn save(&self, desc: &BackupDescriptor) -> Result<()> {
        validate_backup_id(&desc.id)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::catalog_err("create catalog root", e))?;

        let body = serde_json::to_vec_pretty(desc)
            .map_err(|e| Self::catalog_err("encode descriptor", e))?;

        let path = self.record_path(&desc.id);
        let tmp = self.root.join(format!("{}.json.tmp", desc.id));

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Self::catalog_err("create descriptor file", e))?;
        file.write_all(&body)
            .await
            .map_err(|e| Self::catalog_err("write descriptor", e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::catalog_err("sync descriptor", e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::catalog_err("finalize descriptor", e))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<BackupDescriptor> {
        validate_backup_id(id)?;
        let path = self.record_path(id);
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(format!("backup {id}")));
            }
            Err(e) => return Err(Self::catalog_err("read descriptor", e)),
        };
        serde_json::from_slice(&body).map_err(|e| Self::catalog_err("decode descriptor", e))
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        validate_backup_id(id)?;
        match fs::metadata(self.record_path(id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::catalog_err("stat descriptor", e)),
        }
    }

    /// List descriptors matching `filter`, fully ordered (sort key, then id
    /// ascending) and truncated to `filter.limit`.
    pub async fn list(&self, filter: &CatalogFilter) -> Result<Vec<BackupDescriptor>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::catalog_err("read catalog root", e)),
        };

        let mut descriptors = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::catalog_err("read catalog root", e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            // A record deleted between readdir and open is simply absent.
            let body = match fs::read(&path).await {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::catalog_err("read descriptor", e)),
            };
            let desc: BackupDescriptor = serde_json::from_slice(&body)
                .map_err(|e| Self::catalog_err("decode descriptor", e))?;
            if filter.matches(&desc) {
                descriptors.push(desc);
            }
        }

        filter.sort(&mut descriptors);
        if let Some(limit) = filter.limit {
            descriptors.truncate(limit);
        }
        Ok(descriptors)
    }

    /// Remove a descriptor record. Blob cleanup is the orchestrator's job;
    /// see `BackupService::delete_backup`.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_backup_id(id)?;
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(format!("backup {id}")))
            }
            Err(e) => Err(Self::catalog_err("delete descriptor", e)),
        }
    }
}
