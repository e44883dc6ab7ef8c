//! SQLite adapter (embedded-file engine).
//!
//! No subprocess: the database is a single file. Dumps go through SQLite's
//! online backup API into a temp snapshot, which is then streamed into the
//! sink, so a live writer never yields a torn copy. Restore writes a spool
//! file and atomically renames it over the target path.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    ArtifactShape, BackupOptions, Capabilities, ConnectionConfig, DumpReport, DumpSink,
    EngineAdapter, EngineKind, RestoreOptions, RestoreReport, RestoreSource,
};
use crate::catalog::TableInfo;
use crate::error::{BackupError, Result};
use crate::validation::validate_table_name;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const COPY_CHUNK: usize = 64 * 1024;
const BACKUP_PAGES_PER_STEP: std::ffi::c_int = 256;

pub struct SqliteAdapter {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteAdapter {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            path: None,
        }
    }

    fn path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| BackupError::Connection("not connected to sqlite database".into()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| BackupError::Internal("sqlite connection lock poisoned".into()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| BackupError::Connection("not connected to sqlite database".into()))?;
        f(conn).map_err(Self::db_err)
    }

    fn db_err(e: rusqlite::Error) -> BackupError {
        BackupError::Connection(format!("sqlite: {e}"))
    }
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// Online-backup snapshot of `src_path` into `dst_path`, checking the token
// between step batches so cancellation lands between page bursts.
fn snapshot_database(src_path: &Path, dst_path: &Path, cancel: &CancellationToken) -> Result<()> {
    let src = Connection::open(src_path).map_err(SqliteAdapter::db_err)?;
    let mut dst = Connection::open(dst_path).map_err(SqliteAdapter::db_err)?;
    let backup = Backup::new(&src, &mut dst).map_err(|e| BackupError::DumpFailed {
        message: format!("sqlite backup init: {e}"),
        stderr: None,
    })?;

    loop {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        match backup.step(BACKUP_PAGES_PER_STEP) {
            Ok(StepResult::Done) => return Ok(()),
            Ok(StepResult::More) => {}
            Ok(StepResult::Busy) | Ok(StepResult::Locked) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(BackupError::DumpFailed {
                    message: format!("sqlite backup step: {e}"),
                    stderr: None,
                })
            }
        }
    }
}

#[async_trait]
impl EngineAdapter for SqliteAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental: false,
            supports_pitr: false,
            artifact_shape: ArtifactShape::SingleStream,
        }
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<()> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| BackupError::Validation("sqlite requires a database file path".into()))?;
        if !path.exists() {
            return Err(BackupError::Connection(format!(
                "sqlite database {} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open(&path).map_err(Self::db_err)?;
        *self.conn.lock().unwrap() = Some(conn);
        self.path = Some(path);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.conn.lock().unwrap() = None;
        self.path = None;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let name = self
            .path()?
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
        Ok(vec![name])
    }

    async fn list_tables(&self, _database: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    async fn table_info(&self, database: &str) -> Result<Vec<TableInfo>> {
        let tables = self.list_tables(database).await?;
        let mut infos = Vec::with_capacity(tables.len());
        for name in tables {
            validate_table_name(&name)?;
            // Table names cannot be bound parameters; the guard above keeps
            // the interpolation safe.
            let rows = self.with_conn(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| {
                    row.get::<_, i64>(0)
                })
            })?;
            infos.push(TableInfo {
                name,
                rows: rows.max(0) as u64,
                data_bytes: 0,
                index_bytes: 0,
            });
        }
        Ok(infos)
    }

    async fn version(&self) -> Result<String> {
        Ok(format!("SQLite {}", rusqlite::version()))
    }

    async fn estimate_size(&self, _opts: &BackupOptions) -> Result<u64> {
        let meta = std::fs::metadata(self.path()?)
            .map_err(|e| BackupError::Connection(format!("sqlite stat: {e}")))?;
        Ok(meta.len())
    }

    async fn dump(
        &self,
        opts: &BackupOptions,
        sink: &mut DumpSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DumpReport> {
        for table in opts.tables.iter().chain(&opts.exclude_tables) {
            validate_table_name(table)?;
        }
        if !opts.tables.is_empty() || !opts.exclude_tables.is_empty() {
            return Err(BackupError::UnsupportedEngine(
                "sqlite dumps are whole-file; table filters do not apply".into(),
            ));
        }
        let src_path = self.path()?.to_path_buf();

        let spool = tempfile::Builder::new()
            .prefix("sqlite-snapshot-")
            .suffix(".db")
            .tempfile()
            .map_err(|e| BackupError::Internal(format!("snapshot file: {e}")))?;
        let snapshot_path = spool.path().to_path_buf();

        // The backup API is blocking; run the page-copy loop off the
        // runtime's async workers.
        let cancel_clone = cancel.clone();
        tokio::task::spawn_blocking(move || {
            snapshot_database(&src_path, &snapshot_path, &cancel_clone)
        })
        .await
        .map_err(|e| BackupError::Internal(format!("snapshot task: {e}")))??;

        let mut file = File::open(spool.path())
            .map_err(|e| BackupError::Internal(format!("open snapshot: {e}")))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let n = file
                .read(&mut buf)
                .map_err(|e| BackupError::Internal(format!("read snapshot: {e}")))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).map_err(|e| BackupError::DumpFailed {
                message: format!("writing dump stream: {e}"),
                stderr: None,
            })?;
        }

        if opts.parallel > 1 {
            info!(
                requested = opts.parallel,
                "sqlite file copy is single-threaded, using serial"
            );
        }
        Ok(DumpReport {
            effective_parallel: 1,
        })
    }

    async fn restore(
        &self,
        opts: &RestoreOptions,
        source: &mut RestoreSource<'_>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let started_at = chrono::Utc::now();
        let target = self.path()?.to_path_buf();
        let parent = target
            .parent()
            .ok_or_else(|| BackupError::Validation("sqlite target path has no parent".into()))?;

        // Spool next to the target so the final rename stays on one
        // filesystem and is atomic.
        let mut spool = tempfile::Builder::new()
            .prefix(".restore-")
            .suffix(".db.tmp")
            .tempfile_in(parent)
            .map_err(|e| BackupError::RestoreFailed {
                message: format!("restore spool: {e}"),
                stderr: None,
            })?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(crate::codec::map_read_error(e)),
            };
            spool
                .write_all(&buf[..n])
                .map_err(|e| BackupError::RestoreFailed {
                    message: format!("writing restore spool: {e}"),
                    stderr: None,
                })?;
            total += n as u64;
        }

        // Sanity-check the payload before touching the live file.
        spool.flush().map_err(|e| BackupError::RestoreFailed {
            message: format!("flushing restore spool: {e}"),
            stderr: None,
        })?;
        let mut magic = [0u8; 16];
        {
            let mut check = File::open(spool.path()).map_err(|e| BackupError::RestoreFailed {
                message: format!("reopening restore spool: {e}"),
                stderr: None,
            })?;
            if check.read_exact(&mut magic).is_err() || &magic != SQLITE_MAGIC {
                return Err(BackupError::CorruptArtifact(
                    "restored payload is not a sqlite database".into(),
                ));
            }
        }

        // Release our handle on the old file so the rename replaces it
        // cleanly, then swap.
        *self.conn.lock().unwrap() = None;
        spool
            .persist(&target)
            .map_err(|e| BackupError::RestoreFailed {
                message: format!("replacing {}: {e}", target.display()),
                stderr: None,
            })?;
        let conn = Connection::open(&target).map_err(Self::db_err)?;
        *self.conn.lock().unwrap() = Some(conn);
        info!(bytes = total, path = %target.display(), "sqlite database replaced");

        let restored_tables = self.list_tables(&opts.database).await.unwrap_or_default();
        Ok(RestoreReport {
            started_at,
            ended_at: chrono::Utc::now(),
            restored_tables,
            rows_restored: 0,
            effective_parallel: 1,
        })
    }

    async fn validate_restore(&self, _opts: &RestoreOptions) -> Result<()> {
        let target = self.path()?;
        let parent = target
            .parent()
            .ok_or_else(|| BackupError::Validation("sqlite target path has no parent".into()))?;
        if !parent.is_dir() {
            return Err(BackupError::Validation(format!(
                "restore directory {} does not exist",
                parent.display()
            )));
        }
        Ok(())
    }
}
