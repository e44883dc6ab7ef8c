//! Restore orchestrator: the inverse of the backup pipeline.
//!
//! 1. Validate the backup id and load its descriptor; only `success`
//!    descriptors are restorable
//! 2. Stream the artifact out of storage into a spool while hashing; a
//!    checksum mismatch aborts with `CorruptArtifact` before the engine
//!    sees a single byte
//! 3. Reverse the codec (header-driven) and feed the plaintext to the
//!    adapter's restore input
//!
//! Temp state (spool file, unpack directories) is removed on every exit
//! path.

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::BackupStatus;
use crate::codec::sensitive::EncryptionKey;
use crate::codec::ArtifactReader;
use crate::engine::{ConnectionConfig, RestoreOptions, RestoreReport, RestoreSource};
use crate::error::{BackupError, Result};
use crate::pipeline::{connect_with_cancel, BackupService, Progress, ProgressFn, Stage};
use crate::validation::validate_backup_id;

/// Everything needed to restore one backup.
#[derive(Clone)]
pub struct RestoreRequest {
    pub id: String,
    pub connection: ConnectionConfig,
    pub options: RestoreOptions,
    pub encryption_key: Option<EncryptionKey>,
}

impl RestoreRequest {
    pub fn new(id: impl Into<String>, connection: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            connection,
            options: RestoreOptions::default(),
            encryption_key: None,
        }
    }
}

impl BackupService {
    /// Restore a backup end to end.
    pub async fn restore_backup(
        &self,
        req: &RestoreRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        validate_backup_id(&req.id)?;
        let desc = self.catalog().get(&req.id).await?;
        if desc.status != BackupStatus::Success {
            return Err(BackupError::Validation(format!(
                "backup {} is not restorable (status {:?})",
                req.id, desc.status
            )));
        }

        let mut adapter = self.registry().create(desc.engine_kind)?;
        emit(progress, Stage::Connecting, 0, None, "connecting to engine");
        connect_with_cancel(adapter.as_mut(), &req.connection, cancel).await?;

        let result = self
            .run_restore(adapter.as_mut(), &desc, req, progress, cancel)
            .await;
        let _ = adapter.disconnect().await;
        result
    }

    async fn run_restore(
        &self,
        adapter: &mut dyn crate::engine::EngineAdapter,
        desc: &crate::catalog::BackupDescriptor,
        req: &RestoreRequest,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        if !req.options.skip_validation {
            adapter.validate_restore(&req.options).await?;
        }
        if req.options.point_in_time.is_some() && !adapter.capabilities().supports_pitr {
            return Err(BackupError::UnsupportedEngine(format!(
                "{} does not support point-in-time recovery",
                desc.engine_kind
            )));
        }

        // Spool the stored bytes locally, hashing as they stream. The
        // checksum covers exactly the bytes at the storage locator, so a
        // mismatch here proves corruption before any engine side effect.
        let spool = tempfile::Builder::new()
            .prefix("dbbackup-restore-")
            .tempfile_in(self.scratch_dir())
            .map_err(|e| BackupError::Internal(format!("restore spool: {e}")))?;

        let mut remote = self.storage().get(&desc.storage_locator.path).await?;
        let mut digest = Sha256::new();
        let mut spool_writer = std::io::BufWriter::new(
            spool
                .reopen()
                .map_err(|e| BackupError::Internal(format!("restore spool: {e}")))?,
        );
        let mut buf = vec![0u8; 64 * 1024];
        let mut downloaded = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let n = remote
                .read(&mut buf)
                .await
                .map_err(|e| BackupError::Storage(format!("reading artifact: {e}")))?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            std::io::Write::write_all(&mut spool_writer, &buf[..n])
                .map_err(|e| BackupError::Internal(format!("restore spool: {e}")))?;
            downloaded += n as u64;
            emit(
                progress,
                Stage::Transforming,
                downloaded,
                Some(desc.stored_size),
                "verifying artifact",
            );
        }
        std::io::Write::flush(&mut spool_writer)
            .map_err(|e| BackupError::Internal(format!("restore spool: {e}")))?;
        drop(spool_writer);

        let computed = hex::encode(digest.finalize());
        if !desc.checksum.is_empty() && computed != desc.checksum {
            return Err(BackupError::CorruptArtifact(format!(
                "checksum mismatch for {}: descriptor {} but stored bytes {}",
                desc.id, desc.checksum, computed
            )));
        }
        info!(id = %desc.id, bytes = downloaded, "artifact checksum verified");

        // Reverse the codec. The stream header drives the decode; the
        // descriptor is only consulted to cross-check it.
        let spool_file = std::fs::File::open(spool.path())
            .map_err(|e| BackupError::Internal(format!("reopen restore spool: {e}")))?;
        let mut reader = ArtifactReader::open(Box::new(spool_file), req.encryption_key.as_ref())?;
        let header = *reader.spec();
        if header.compression != desc.codec.compression
            || header.encryption != desc.codec.encryption
        {
            return Err(BackupError::CorruptArtifact(format!(
                "artifact header disagrees with descriptor codec ({}/{:?} vs {}/{:?})",
                header.compression, header.encryption, desc.codec.compression, desc.codec.encryption
            )));
        }

        emit(progress, Stage::Finalizing, 0, None, "replaying into engine");
        let mut source = RestoreSource::new(&mut reader);
        let report = adapter.restore(&req.options, &mut source, cancel).await?;

        info!(
            id = %desc.id,
            engine = %desc.engine_kind,
            tables = report.restored_tables.len(),
            "restore complete"
        );
        Ok(report)
    }
}

fn emit(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogFilter, FsCatalog};
    use crate::codec::{CodecSpec, Compression, Encryption};
    use crate::engine::{EngineKind, EngineRegistry};
    use crate::pipeline::BackupRequest;
    use crate::storage::local::LocalStorage;
    use chrono::Utc;
    use rusqlite::Connection;
    use std::path::Path;
    use std::sync::Arc;

    fn seed_database(path: &Path, rows: u32) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, item TEXT);
             CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();
        for i in 0..rows {
            conn.execute("INSERT INTO orders (item) VALUES (?1)", [format!("item-{i}")])
                .unwrap();
        }
        conn.execute("INSERT INTO users (name) VALUES ('ada')", [])
            .unwrap();
    }

    fn count(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn service(dir: &Path) -> BackupService {
        BackupService::new(
            Arc::new(EngineRegistry::builtin()),
            Arc::new(FsCatalog::new(dir.join("catalog"))),
            Arc::new(LocalStorage::new(dir.join("storage"))),
        )
        .with_scratch_dir(dir)
    }

    fn sqlite_request(db_path: &Path, codec: CodecSpec, key: Option<EncryptionKey>) -> BackupRequest {
        let mut req = BackupRequest::new(
            EngineKind::Sqlite,
            ConnectionConfig {
                path: Some(db_path.to_path_buf()),
                ..Default::default()
            },
        );
        req.codec = codec;
        req.encryption_key = key;
        req
    }

    #[tokio::test]
    async fn test_roundtrip_compressed_unencrypted() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shop.db");
        seed_database(&db_path, 40);

        let service = service(dir.path());
        let codec = CodecSpec {
            compression: Compression::Gzip,
            compression_level: Some(6),
            encryption: Encryption::None,
        };
        let desc = service
            .create_backup(
                &sqlite_request(&db_path, codec, None),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(desc.raw_size > 0);
        assert!(desc.stored_size < desc.raw_size); // sqlite pages compress well
        assert_eq!(desc.databases, vec!["shop"]);
        assert_eq!(desc.tables.len(), 2);

        // Damage the live database, then restore.
        Connection::open(&db_path)
            .unwrap()
            .execute("DELETE FROM orders", [])
            .unwrap();
        assert_eq!(count(&db_path, "orders"), 0);

        let report = service
            .restore_backup(
                &RestoreRequest::new(
                    desc.id.clone(),
                    ConnectionConfig {
                        path: Some(db_path.clone()),
                        ..Default::default()
                    },
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(count(&db_path, "orders"), 40);
        assert_eq!(count(&db_path, "users"), 1);
        assert!(report.restored_tables.contains(&"orders".to_string()));
    }

    #[tokio::test]
    async fn test_roundtrip_encrypted_and_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shop.db");
        seed_database(&db_path, 10);

        let service = service(dir.path());
        let key = EncryptionKey::generate();
        let codec = CodecSpec {
            compression: Compression::Zstd,
            compression_level: Some(3),
            encryption: Encryption::Aead256,
        };
        let desc = service
            .create_backup(
                &sqlite_request(&db_path, codec, Some(key.clone())),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Flip one byte of the stored artifact.
        let blob_path = dir
            .path()
            .join("storage")
            .join(&desc.storage_locator.path);
        let mut bytes = std::fs::read(&blob_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        std::fs::write(&blob_path, &bytes).unwrap();

        let before = count(&db_path, "orders");
        let mut restore_req = RestoreRequest::new(
            desc.id.clone(),
            ConnectionConfig {
                path: Some(db_path.clone()),
                ..Default::default()
            },
        );
        restore_req.encryption_key = Some(key.clone());

        let err = service
            .restore_backup(&restore_req, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArtifact);
        // The engine was never touched.
        assert_eq!(count(&db_path, "orders"), before);

        // Undamage and restore cleanly.
        bytes[mid] ^= 0x01;
        std::fs::write(&blob_path, &bytes).unwrap();
        service
            .restore_backup(&restore_req, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count(&db_path, "orders"), 10);
    }

    #[tokio::test]
    async fn test_restore_requires_key_for_encrypted_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shop.db");
        seed_database(&db_path, 5);

        let service = service(dir.path());
        let key = EncryptionKey::generate();
        let codec = CodecSpec {
            compression: Compression::None,
            compression_level: None,
            encryption: Encryption::Aead256,
        };
        let desc = service
            .create_backup(
                &sqlite_request(&db_path, codec, Some(key)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let err = service
            .restore_backup(
                &RestoreRequest::new(
                    desc.id,
                    ConnectionConfig {
                        path: Some(db_path),
                        ..Default::default()
                    },
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Encryption);
    }

    #[tokio::test]
    async fn test_restore_refuses_non_success_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shop.db");
        seed_database(&db_path, 1);
        let service = service(dir.path());

        // Persist a pending descriptor by hand.
        let id = crate::pipeline::mint_backup_id(Utc::now());
        let desc = crate::catalog::BackupDescriptor {
            id: id.clone(),
            name: None,
            engine_kind: EngineKind::Sqlite,
            engine_version: String::new(),
            databases: vec!["shop".into()],
            tables: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            raw_size: 0,
            stored_size: 0,
            codec: CodecSpec::plain(),
            checksum: String::new(),
            storage_locator: crate::catalog::StorageLocator {
                provider: "local".into(),
                path: format!("{id}/artifact.bin"),
            },
            tags: Default::default(),
            status: BackupStatus::Pending,
            error: None,
            deletion_pending: false,
            extra: Default::default(),
        };
        service.catalog().save(&desc).await.unwrap();

        let err = service
            .restore_backup(
                &RestoreRequest::new(
                    id,
                    ConnectionConfig {
                        path: Some(db_path),
                        ..Default::default()
                    },
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_restore_traversal_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let err = service
            .restore_backup(
                &RestoreRequest::new(
                    "backup-2025-01-01-00-00-00-aaaaaaaa/../etc",
                    ConnectionConfig::default(),
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_restore_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let err = service
            .restore_backup(
                &RestoreRequest::new(
                    "backup-2030-01-01-00-00-00-deadbeef",
                    ConnectionConfig::default(),
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_catalog_reflects_roundtrip_history() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shop.db");
        seed_database(&db_path, 3);
        let service = service(dir.path());

        for _ in 0..2 {
            service
                .create_backup(
                    &sqlite_request(&db_path, CodecSpec::plain(), None),
                    None,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
        }
        let listed = service
            .list_backups(&CatalogFilter {
                engine_kind: Some(EngineKind::Sqlite),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| d.status == BackupStatus::Success));
    }
}
