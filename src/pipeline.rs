//! Backup pipeline orchestrator.
//!
//! Coordinates the full create flow:
//! 1. Guard-validate every externally-sourced identifier
//! 2. Mint the backup id and persist a `pending` descriptor
//! 3. Connect the engine adapter
//! 4. Stream the dump through the codec into a spool file
//! 5. Upload the sealed artifact to storage
//! 6. Finalize the descriptor (checksum, sizes, tables) as `success`
//!
//! Any failure marks the descriptor `failed`, deletes the partial storage
//! object, and surfaces the error unchanged; the core never retries.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{
    BackupDescriptor, BackupFailure, BackupStatus, CatalogFilter, FsCatalog, StorageLocator,
};
use crate::codec::sensitive::EncryptionKey;
use crate::codec::{ArtifactWriter, CodecSpec, Encryption};
use crate::engine::{
    ArtifactShape, BackupOptions, ConnectionConfig, DumpSink, EngineAdapter, EngineKind,
    EngineRegistry,
};
use crate::error::{BackupError, Result};
use crate::storage::Storage;
use crate::validation::{
    validate_backup_id, validate_compression_level, validate_database_name, validate_table_name,
};

/// Pipeline stage reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connecting,
    Dumping,
    Transforming,
    Uploading,
    Finalizing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Connecting => "connecting",
            Stage::Dumping => "dumping",
            Stage::Transforming => "transforming",
            Stage::Uploading => "uploading",
            Stage::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

/// One progress tick. Fire-and-forget: callbacks must return promptly, the
/// pipeline does not buffer or defer them.
#[derive(Debug, Clone)]
pub struct Progress {
    pub stage: Stage,
    pub percent: u8,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub message: String,
}

pub type ProgressFn = dyn Fn(Progress) + Send + Sync;

fn report(
    progress: Option<&ProgressFn>,
    stage: Stage,
    bytes_done: u64,
    bytes_total: Option<u64>,
    message: &str,
) {
    if let Some(cb) = progress {
        let percent = match bytes_total {
            Some(total) if total > 0 => ((bytes_done * 100) / total).min(100) as u8,
            _ => 0,
        };
        cb(Progress {
            stage,
            percent,
            bytes_done,
            bytes_total,
            message: message.to_string(),
        });
    }
}

/// Everything needed to create one backup.
#[derive(Clone)]
pub struct BackupRequest {
    pub name: Option<String>,
    pub engine: EngineKind,
    pub connection: ConnectionConfig,
    pub options: BackupOptions,
    pub codec: CodecSpec,
    pub encryption_key: Option<EncryptionKey>,
    pub tags: BTreeMap<String, String>,
    pub dry_run: bool,
}

impl BackupRequest {
    pub fn new(engine: EngineKind, connection: ConnectionConfig) -> Self {
        Self {
            name: None,
            engine,
            connection,
            options: BackupOptions::default(),
            codec: CodecSpec::plain(),
            encryption_key: None,
            tags: BTreeMap::new(),
            dry_run: false,
        }
    }
}

/// Mint a catalog id: `backup-YYYY-MM-DD-HH-MM-SS-<8 hex>`.
pub fn mint_backup_id(at: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    format!(
        "backup-{}-{}",
        at.format("%Y-%m-%d-%H-%M-%S"),
        hex::encode(suffix)
    )
}

/// The imperative API consumed by CLI and HTTP glue. Owns the registry, the
/// catalog, and a storage provider; individual operations share them
/// read-only, so any number can run concurrently.
pub struct BackupService {
    registry: Arc<EngineRegistry>,
    catalog: Arc<FsCatalog>,
    storage: Arc<dyn Storage>,
    scratch_dir: PathBuf,
}

impl BackupService {
    pub fn new(
        registry: Arc<EngineRegistry>,
        catalog: Arc<FsCatalog>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            registry,
            catalog,
            storage,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory for codec spool files (defaults to the system temp dir).
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn catalog(&self) -> &FsCatalog {
        &self.catalog
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub(crate) fn scratch_dir(&self) -> &std::path::Path {
        &self.scratch_dir
    }

    pub async fn list_backups(&self, filter: &CatalogFilter) -> Result<Vec<BackupDescriptor>> {
        self.catalog.list(filter).await
    }

    pub async fn get_backup(&self, id: &str) -> Result<BackupDescriptor> {
        self.catalog.get(id).await
    }

    /// Delete a backup: storage blobs first, then the catalog record. A
    /// partial blob delete leaves the record `failed` with a
    /// `deletion_pending` marker and the orphan locator for operators.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        validate_backup_id(id)?;
        let mut desc = self.catalog.get(id).await?;

        let prefix = format!("{id}/");
        let keys = self.storage.list(&prefix).await?;
        for key in &keys {
            if let Err(e) = self.storage.delete(key).await {
                warn!(id, key = %key, error = %e, "orphaned blob left behind by partial delete");
                desc.status = BackupStatus::Failed;
                desc.deletion_pending = true;
                desc.error = Some(BackupFailure {
                    kind: e.kind(),
                    message: format!("delete left orphaned storage objects: {e}"),
                    metadata: BTreeMap::from([(
                        "orphan".to_string(),
                        format!("{}:{}", desc.storage_locator.provider, key),
                    )]),
                });
                self.catalog.save(&desc).await?;
                return Err(e);
            }
        }

        self.catalog.delete(id).await?;
        info!(id, blobs = keys.len(), "backup deleted");
        Ok(())
    }

    /// Create a backup end to end. On success the returned descriptor is
    /// exactly what the catalog holds; on failure the catalog record (if
    /// one was persisted) is marked `failed` and partial artifacts are
    /// removed.
    pub async fn create_backup(
        &self,
        req: &BackupRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<BackupDescriptor> {
        // 1. Validation, before any side effect.
        validate_request(req)?;
        let mut adapter = self.registry.create(req.engine)?;

        if req.dry_run {
            return self.dry_run(adapter.as_mut(), req, progress, cancel).await;
        }

        // 2-3. Mint the id and persist the pending descriptor so stranded
        // attempts are discoverable after a crash.
        let started_at = Utc::now();
        let id = mint_backup_id(started_at);
        let artifact_name = match adapter.capabilities().artifact_shape {
            ArtifactShape::SingleStream => "artifact.bin",
            ArtifactShape::DirectoryTree => "tree.tar.bin",
        };
        let mut desc = BackupDescriptor {
            id: id.clone(),
            name: req.name.clone(),
            engine_kind: req.engine,
            engine_version: String::new(),
            databases: requested_databases(req),
            tables: Vec::new(),
            started_at,
            ended_at: None,
            raw_size: 0,
            stored_size: 0,
            codec: req.codec,
            checksum: String::new(),
            storage_locator: StorageLocator {
                provider: self.storage.provider().to_string(),
                path: format!("{id}/{artifact_name}"),
            },
            tags: req.tags.clone(),
            status: BackupStatus::Pending,
            error: None,
            deletion_pending: false,
            extra: serde_json::Map::new(),
        };
        self.catalog.save(&desc).await?;

        match self
            .run_create(adapter.as_mut(), &mut desc, req, progress, cancel)
            .await
        {
            Ok(()) => {
                let _ = adapter.disconnect().await;
                Ok(desc)
            }
            Err(e) => {
                let _ = adapter.disconnect().await;
                self.mark_failed(&mut desc, &e).await;
                Err(e)
            }
        }
    }

    async fn run_create(
        &self,
        adapter: &mut dyn EngineAdapter,
        desc: &mut BackupDescriptor,
        req: &BackupRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        report(progress, Stage::Connecting, 0, None, "connecting to engine");
        connect_with_cancel(adapter, &req.connection, cancel).await?;

        // The attempt is now live.
        desc.status = BackupStatus::InProgress;
        if desc.databases.is_empty() {
            desc.databases = adapter.list_databases().await.unwrap_or_default();
        }
        self.catalog.save(desc).await?;

        let bytes_total = adapter.estimate_size(&req.options).await.ok();

        // Dump through the codec into a local spool, so the checksum is
        // computed over exactly the bytes storage will receive.
        let spool = tempfile::Builder::new()
            .prefix("dbbackup-spool-")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| BackupError::Internal(format!("spool file: {e}")))?;
        let spool_file = spool
            .reopen()
            .map_err(|e| BackupError::Internal(format!("spool file: {e}")))?;

        report(progress, Stage::Dumping, 0, bytes_total, "dumping");
        let mut writer = ArtifactWriter::new(
            Box::new(spool_file),
            &req.codec,
            req.encryption_key.as_ref(),
        )?;
        let dump_report = {
            let tick = |bytes: u64| {
                report(progress, Stage::Dumping, bytes, bytes_total, "dumping");
            };
            let mut sink = DumpSink::with_observer(&mut writer, &tick);
            adapter.dump(&req.options, &mut sink, cancel).await?
        };
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        report(progress, Stage::Transforming, 0, None, "sealing artifact");
        writer
            .flush()
            .map_err(|e| BackupError::Internal(format!("spool flush: {e}")))?;
        let summary = writer.finish()?;

        // Upload the sealed spool.
        report(
            progress,
            Stage::Uploading,
            0,
            Some(summary.stored_size),
            "uploading artifact",
        );
        let mut upload = tokio::fs::File::open(spool.path())
            .await
            .map_err(|e| BackupError::Internal(format!("reopen spool: {e}")))?;
        let stored = tokio::select! {
            stored = self.storage.put(
                &desc.storage_locator.path,
                &mut upload,
                Some(summary.stored_size),
            ) => stored?,
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
        };
        report(
            progress,
            Stage::Uploading,
            stored,
            Some(summary.stored_size),
            "artifact uploaded",
        );

        // Finalize: success only once the checksum is recorded and the
        // descriptor hits the catalog.
        report(progress, Stage::Finalizing, 0, None, "finalizing descriptor");
        desc.engine_version = adapter.version().await.unwrap_or_default();
        if let Some(db) = desc.databases.first().cloned() {
            desc.tables = adapter.table_info(&db).await.unwrap_or_default();
        }
        desc.raw_size = summary.raw_size;
        desc.stored_size = summary.stored_size;
        desc.checksum = summary.checksum;
        desc.ended_at = Some(Utc::now());
        desc.status = BackupStatus::Success;
        self.catalog.save(desc).await?;

        info!(
            id = %desc.id,
            engine = %desc.engine_kind,
            raw = desc.raw_size,
            stored = stored,
            parallel = dump_report.effective_parallel,
            "backup complete"
        );
        Ok(())
    }

    async fn dry_run(
        &self,
        adapter: &mut dyn EngineAdapter,
        req: &BackupRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<BackupDescriptor> {
        report(progress, Stage::Connecting, 0, None, "connecting to engine");
        connect_with_cancel(adapter, &req.connection, cancel).await?;

        let estimate = adapter.estimate_size(&req.options).await.unwrap_or(0);
        let engine_version = adapter.version().await.unwrap_or_default();
        let mut databases = requested_databases(req);
        if databases.is_empty() {
            databases = adapter.list_databases().await.unwrap_or_default();
        }
        let _ = adapter.disconnect().await;

        let started_at = Utc::now();
        let id = mint_backup_id(started_at);
        Ok(BackupDescriptor {
            id: id.clone(),
            name: req.name.clone(),
            engine_kind: req.engine,
            engine_version,
            databases,
            tables: Vec::new(),
            started_at,
            ended_at: Some(Utc::now()),
            raw_size: estimate,
            stored_size: 0,
            codec: req.codec,
            checksum: String::new(),
            storage_locator: StorageLocator {
                provider: self.storage.provider().to_string(),
                path: format!("{id}/artifact.bin"),
            },
            tags: req.tags.clone(),
            status: BackupStatus::Pending,
            error: None,
            deletion_pending: false,
            extra: serde_json::Map::new(),
        })
    }

    // Mark the descriptor failed and remove whatever made it to storage.
    // If the orphan delete also fails, the locator is recorded for
    // operator cleanup.
    async fn mark_failed(&self, desc: &mut BackupDescriptor, cause: &BackupError) {
        desc.status = BackupStatus::Failed;
        desc.ended_at = Some(Utc::now());
        desc.error = Some(failure_from(cause));

        if let Err(delete_err) = self.storage.delete(&desc.storage_locator.path).await {
            warn!(
                id = %desc.id,
                error = %delete_err,
                "failed to remove partial artifact"
            );
            if let Some(failure) = &mut desc.error {
                failure.metadata.insert(
                    "orphan".to_string(),
                    format!(
                        "{}:{}",
                        desc.storage_locator.provider, desc.storage_locator.path
                    ),
                );
            }
        }

        if let Err(save_err) = self.catalog.save(desc).await {
            warn!(id = %desc.id, error = %save_err, "failed to persist failed descriptor");
        }
    }
}

pub(crate) async fn connect_with_cancel(
    adapter: &mut dyn EngineAdapter,
    connection: &ConnectionConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        connected = adapter.connect(connection) => connected,
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
    }
}

fn requested_databases(req: &BackupRequest) -> Vec<String> {
    if !req.options.databases.is_empty() {
        req.options.databases.clone()
    } else if !req.connection.database.is_empty() {
        vec![req.connection.database.clone()]
    } else if let Some(path) = &req.connection.path {
        path.file_stem()
            .map(|s| vec![s.to_string_lossy().into_owned()])
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}

pub(crate) fn failure_from(e: &BackupError) -> BackupFailure {
    let mut metadata = BTreeMap::new();
    match e {
        BackupError::DumpFailed {
            stderr: Some(stderr),
            ..
        }
        | BackupError::RestoreFailed {
            stderr: Some(stderr),
            ..
        } if !stderr.is_empty() => {
            metadata.insert("stderr".to_string(), stderr.clone());
        }
        _ => {}
    }
    BackupFailure {
        kind: e.kind(),
        message: e.to_string(),
        metadata,
    }
}

fn validate_request(req: &BackupRequest) -> Result<()> {
    for db in &req.options.databases {
        validate_database_name(db)?;
    }
    if req.options.databases.is_empty() && !req.connection.database.is_empty() {
        validate_database_name(&req.connection.database)?;
    }
    for table in req.options.tables.iter().chain(&req.options.exclude_tables) {
        validate_table_name(table)?;
    }
    if let Some(level) = req.codec.compression_level {
        validate_compression_level(req.codec.compression, level)?;
    }
    if req.codec.encryption == Encryption::Aead256 && req.encryption_key.is_none() {
        return Err(BackupError::Encryption(
            "encryption requested but no key provided".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableInfo;
    use crate::engine::{Capabilities, DumpReport, RestoreOptions, RestoreReport, RestoreSource};
    use crate::storage::local::LocalStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    // Slow in-memory adapter: emits a chunk every poll until cancelled.
    struct SlowAdapter {
        chunks: usize,
        delay: Duration,
    }

    #[async_trait]
    impl EngineAdapter for SlowAdapter {
        fn kind(&self) -> EngineKind {
            EngineKind::Postgres
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_incremental: false,
                supports_pitr: false,
                artifact_shape: ArtifactShape::SingleStream,
            }
        }

        async fn connect(&mut self, _config: &ConnectionConfig) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn list_databases(&self) -> Result<Vec<String>> {
            Ok(vec!["slow".into()])
        }

        async fn list_tables(&self, _database: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn table_info(&self, _database: &str) -> Result<Vec<TableInfo>> {
            Ok(Vec::new())
        }

        async fn version(&self) -> Result<String> {
            Ok("slow 1.0".into())
        }

        async fn estimate_size(&self, _opts: &BackupOptions) -> Result<u64> {
            Ok((self.chunks * 8) as u64)
        }

        async fn dump(
            &self,
            _opts: &BackupOptions,
            sink: &mut DumpSink<'_>,
            cancel: &CancellationToken,
        ) -> Result<DumpReport> {
            for _ in 0..self.chunks {
                if cancel.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }
                sink.write_all(b"chunk!!\n")
                    .map_err(|e| BackupError::DumpFailed {
                        message: e.to_string(),
                        stderr: None,
                    })?;
                tokio::time::sleep(self.delay).await;
            }
            Ok(DumpReport {
                effective_parallel: 1,
            })
        }

        async fn restore(
            &self,
            _opts: &RestoreOptions,
            _source: &mut RestoreSource<'_>,
            _cancel: &CancellationToken,
        ) -> Result<RestoreReport> {
            Err(BackupError::Internal("not used".into()))
        }

        async fn validate_restore(&self, _opts: &RestoreOptions) -> Result<()> {
            Ok(())
        }
    }

    fn slow_service(dir: &std::path::Path, chunks: usize, delay: Duration) -> BackupService {
        let mut registry = EngineRegistry::new();
        registry.register(EngineKind::Postgres, move || {
            Box::new(SlowAdapter { chunks, delay })
        });
        BackupService::new(
            Arc::new(registry),
            Arc::new(FsCatalog::new(dir.join("catalog"))),
            Arc::new(LocalStorage::new(dir.join("storage"))),
        )
        .with_scratch_dir(dir)
    }

    fn request() -> BackupRequest {
        BackupRequest::new(
            EngineKind::Postgres,
            ConnectionConfig {
                database: "slow".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_minted_id_is_canonical() {
        for _ in 0..16 {
            let id = mint_backup_id(Utc::now());
            validate_backup_id(&id).unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_succeeds_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 4, Duration::from_millis(1));

        let stages = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let stages_for_progress = stages.clone();
        let progress = move |p: Progress| stages_for_progress.lock().unwrap().push(p.stage);

        let desc = service
            .create_backup(&request(), Some(&progress), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(desc.status, BackupStatus::Success);
        assert_eq!(desc.raw_size, 32);
        assert!(desc.stored_size > 0);
        assert!(!desc.checksum.is_empty());
        assert_eq!(desc.engine_version, "slow 1.0");

        // Success implies both the catalog record and the storage blob.
        let stored = service.get_backup(&desc.id).await.unwrap();
        assert_eq!(stored.status, BackupStatus::Success);
        assert!(service
            .storage()
            .exists(&desc.storage_locator.path)
            .await
            .unwrap());

        let seen = stages.lock().unwrap();
        assert_eq!(seen.first(), Some(&Stage::Connecting));
        assert!(seen.contains(&Stage::Dumping));
        assert!(seen.contains(&Stage::Uploading));
        assert_eq!(seen.last(), Some(&Stage::Finalizing));
    }

    #[tokio::test]
    async fn test_validation_failure_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 1, Duration::from_millis(1));

        let mut req = request();
        req.options.databases = vec!["shop'; DROP TABLE users--".into()];
        let err = service
            .create_backup(&req, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        assert!(service
            .list_backups(&CatalogFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(service.storage().list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_engine_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 1, Duration::from_millis(1));

        let mut req = request();
        req.engine = EngineKind::MongoDb;
        let err = service
            .create_backup(&req, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedEngine);
        assert!(service
            .list_backups(&CatalogFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 1, Duration::from_millis(1));

        let mut req = request();
        req.codec.encryption = Encryption::Aead256;
        let err = service
            .create_backup(&req, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Encryption);
    }

    #[tokio::test]
    async fn test_cancellation_marks_failed_and_cleans_storage() {
        let dir = tempfile::tempdir().unwrap();
        // Long enough to be mid-dump when the token fires.
        let service = slow_service(dir.path(), 10_000, Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = service
            .create_backup(&request(), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(15));

        // Descriptor failed with kind cancelled, no artifact left behind.
        let listed = service
            .list_backups(&CatalogFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, BackupStatus::Failed);
        assert_eq!(
            listed[0].error.as_ref().unwrap().kind,
            crate::error::ErrorKind::Cancelled
        );
        assert!(service.storage().list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 4, Duration::from_millis(1));

        let mut req = request();
        req.dry_run = true;
        let desc = service
            .create_backup(&req, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(desc.status, BackupStatus::Pending);
        assert_eq!(desc.raw_size, 32); // the adapter's estimate
        assert!(service
            .list_backups(&CatalogFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(service.storage().list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_backup_removes_record_and_blob() {
        let dir = tempfile::tempdir().unwrap();
        let service = slow_service(dir.path(), 2, Duration::from_millis(1));

        let desc = service
            .create_backup(&request(), None, &CancellationToken::new())
            .await
            .unwrap();
        service.delete_backup(&desc.id).await.unwrap();

        assert!(matches!(
            service.get_backup(&desc.id).await.unwrap_err(),
            BackupError::NotFound(_)
        ));
        assert!(service.storage().list("").await.unwrap().is_empty());
    }
}
