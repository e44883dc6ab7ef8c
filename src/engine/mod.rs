//! Pluggable engine adapters.
//!
//! Each supported database engine (PostgreSQL, MySQL, MongoDB, SQLite)
//! implements the `EngineAdapter` trait to provide a uniform contract for
//! connecting, enumerating, dumping, and restoring. Adapters produce and
//! consume raw artifact bytes through sink/source abstractions; the codec
//! and storage layers never know which engine they are serving.

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod process;
pub mod sqlite;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::TableInfo;
use crate::error::{BackupError, Result};

/// The engine families the core can back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    MySql,
    MongoDb,
    Sqlite,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineKind::Postgres => "postgres",
            EngineKind::MySql => "mysql",
            EngineKind::MongoDb => "mongodb",
            EngineKind::Sqlite => "sqlite",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for EngineKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" | "postgresql" => Ok(EngineKind::Postgres),
            "mysql" => Ok(EngineKind::MySql),
            "mongodb" | "mongo" => Ok(EngineKind::MongoDb),
            "sqlite" => Ok(EngineKind::Sqlite),
            other => Err(BackupError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Shape of the bytes an engine's dump produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactShape {
    /// One logical byte stream (SQL dump, database file).
    SingleStream,
    /// A rooted tree of files, tar-encoded before the codec.
    DirectoryTree,
}

/// What an engine can and cannot do.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_incremental: bool,
    pub supports_pitr: bool,
    pub artifact_shape: ArtifactShape,
}

/// How to reach the source engine. The embedded-file engine uses `path`
/// instead of host/port. Credentials never appear on subprocess argv.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: Option<String>,
    /// Database file path, embedded-file engine only.
    pub path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub max_connections: u32,
    pub options: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            ssl_mode: None,
            path: None,
            connect_timeout: Duration::from_secs(30),
            max_connections: 5,
            options: BTreeMap::new(),
        }
    }
}

/// Dump options, guard-validated by the orchestrator and re-validated by
/// every adapter before anything reaches a subprocess argument list.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub databases: Vec<String>,
    pub all_databases: bool,
    pub tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    /// Engine-appropriate consistency mode (serializable-deferrable,
    /// single transaction, oplog capture).
    pub consistent: bool,
    pub parallel: u32,
    /// Require a pipe-through dump with no intermediate spool. Engines
    /// whose tools cannot stream to stdout answer `Unsupported`.
    pub direct_stream: bool,
}

/// Restore options.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub database: String,
    pub tables: Vec<String>,
    pub drop_existing: bool,
    pub parallel: u32,
    /// Opaque point-in-time target, forwarded to engines that support it.
    pub point_in_time: Option<DateTime<Utc>>,
    pub skip_validation: bool,
}

/// What a dump actually did.
#[derive(Debug, Clone)]
pub struct DumpReport {
    /// Parallelism the engine honored; 1 when a parallel request was
    /// silently degraded to a serial dump.
    pub effective_parallel: u32,
}

/// What a restore actually did.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub restored_tables: Vec<String>,
    /// 0 when the engine does not report row counts.
    pub rows_restored: u64,
    pub effective_parallel: u32,
}

/// Where dump bytes go. Counts throughput and notifies an observer so the
/// orchestrator can report progress without the adapter knowing about it.
pub struct DumpSink<'a> {
    writer: &'a mut (dyn Write + Send),
    bytes: u64,
    observer: Option<&'a (dyn Fn(u64) + Send + Sync)>,
}

impl<'a> DumpSink<'a> {
    pub fn new(writer: &'a mut (dyn Write + Send)) -> Self {
        Self {
            writer,
            bytes: 0,
            observer: None,
        }
    }

    pub fn with_observer(
        writer: &'a mut (dyn Write + Send),
        observer: &'a (dyn Fn(u64) + Send + Sync),
    ) -> Self {
        Self {
            writer,
            bytes: 0,
            observer: Some(observer),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

impl Write for DumpSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.bytes += n as u64;
        if let Some(observer) = self.observer {
            observer(self.bytes);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Where restore bytes come from (the decoded artifact stream).
pub struct RestoreSource<'a> {
    reader: &'a mut (dyn Read + Send),
}

impl<'a> RestoreSource<'a> {
    pub fn new(reader: &'a mut (dyn Read + Send)) -> Self {
        Self { reader }
    }
}

impl Read for RestoreSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Uniform adapter contract. One instance serves one create or restore
/// operation; instances are never shared across operations.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn capabilities(&self) -> Capabilities;

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

    /// Per-table figures for the descriptor. Engines that cannot enumerate
    /// return an empty list.
    async fn table_info(&self, database: &str) -> Result<Vec<TableInfo>>;

    async fn version(&self) -> Result<String>;

    /// Estimated raw dump size in bytes, for dry runs and progress totals.
    async fn estimate_size(&self, opts: &BackupOptions) -> Result<u64>;

    /// Write raw artifact bytes (or a tar-encoded tree) into the sink.
    async fn dump(
        &self,
        opts: &BackupOptions,
        sink: &mut DumpSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DumpReport>;

    /// Consume decoded artifact bytes and replay them into the engine.
    async fn restore(
        &self,
        opts: &RestoreOptions,
        source: &mut RestoreSource<'_>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport>;

    /// Cheap preconditions check before a restore mutates anything.
    async fn validate_restore(&self, opts: &RestoreOptions) -> Result<()>;
}

type AdapterFactory = Box<dyn Fn() -> Box<dyn EngineAdapter> + Send + Sync>;

/// Maps engine kinds to adapter factories.
///
/// Built once by the composition root and shared read-only behind an `Arc`;
/// there is no init-time self-registration and no per-read locking.
#[derive(Default)]
pub struct EngineRegistry {
    factories: HashMap<EngineKind, AdapterFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all four built-in adapters.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EngineKind::Postgres, || {
            Box::new(postgres::PostgresAdapter::new())
        });
        registry.register(EngineKind::MySql, || Box::new(mysql::MySqlAdapter::new()));
        registry.register(EngineKind::MongoDb, || {
            Box::new(mongodb::MongoDbAdapter::new())
        });
        registry.register(EngineKind::Sqlite, || Box::new(sqlite::SqliteAdapter::new()));
        registry
    }

    pub fn register<F>(&mut self, kind: EngineKind, factory: F)
    where
        F: Fn() -> Box<dyn EngineAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Create a fresh adapter for `kind`.
    pub fn create(&self, kind: EngineKind) -> Result<Box<dyn EngineAdapter>> {
        match self.factories.get(&kind) {
            Some(factory) => Ok(factory()),
            None => Err(BackupError::UnsupportedEngine(format!(
                "no adapter registered for engine {kind}"
            ))),
        }
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}
