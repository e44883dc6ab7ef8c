//! MongoDB adapter (document engine).
//!
//! Metadata goes through the official driver; dump and restore shell out to
//! `mongodump` / `mongorestore`. The tools produce and consume a directory
//! tree, so the adapter spools to a temp directory and tars the tree into
//! the sink (and the reverse on restore). mongodump has no password
//! environment variable, so the credential travels in a 0600 temp config
//! file passed via `--config`, never on argv.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process::{run_to_completion, ToolCommand};
use super::{
    ArtifactShape, BackupOptions, Capabilities, ConnectionConfig, DumpReport, DumpSink,
    EngineAdapter, EngineKind, RestoreOptions, RestoreReport, RestoreSource,
};
use crate::catalog::TableInfo;
use crate::codec::archive;
use crate::error::{BackupError, Result};
use crate::validation::{validate_database_name, validate_port, validate_table_name};

const DEFAULT_PORT: u16 = 27017;

pub struct MongoDbAdapter {
    client: Option<Client>,
    config: Option<ConnectionConfig>,
}

impl MongoDbAdapter {
    pub fn new() -> Self {
        Self {
            client: None,
            config: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BackupError::Connection("not connected to mongodb".into()))
    }

    fn config(&self) -> Result<&ConnectionConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| BackupError::Connection("not connected to mongodb".into()))
    }

    fn port(config: &ConnectionConfig) -> u16 {
        if config.port == 0 {
            DEFAULT_PORT
        } else {
            config.port
        }
    }

    fn connection_uri(config: &ConnectionConfig) -> String {
        let auth = if !config.username.is_empty() && !config.password.is_empty() {
            format!("{}:{}@", config.username, config.password)
        } else {
            String::new()
        };
        let database = if config.database.is_empty() {
            String::new()
        } else {
            format!("/{}", config.database)
        };
        format!(
            "mongodb://{auth}{}:{}{database}",
            config.host,
            Self::port(config)
        )
    }

    fn db_err(e: mongodb::error::Error) -> BackupError {
        BackupError::Connection(format!("mongodb: {e}"))
    }

    // mongodump/mongorestore read the password from a YAML config file;
    // 0600 keeps it from other local users, argv stays clean.
    fn credential_file(&self) -> Result<Option<NamedTempFile>> {
        let config = self.config()?;
        if config.password.is_empty() {
            return Ok(None);
        }
        let mut file = NamedTempFile::new()
            .map_err(|e| BackupError::Internal(format!("credential file: {e}")))?;
        writeln!(file, "password: {}", config.password)
            .map_err(|e| BackupError::Internal(format!("credential file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| BackupError::Internal(format!("credential file: {e}")))?;
        }
        Ok(Some(file))
    }

    fn tool(&self, program: &str, credentials: Option<&NamedTempFile>) -> Result<ToolCommand> {
        let config = self.config()?;
        let mut command = ToolCommand::new(program).args([
            "--host".to_string(),
            config.host.clone(),
            "--port".to_string(),
            Self::port(config).to_string(),
        ]);
        if !config.username.is_empty() {
            command = command
                .arg("--username")
                .arg(config.username.clone())
                .arg("--authenticationDatabase")
                .arg("admin");
        }
        if let Some(file) = credentials {
            command = command.arg(format!("--config={}", file.path().display()));
        }
        Ok(command)
    }

    fn target_database(&self, requested: &[String]) -> Result<Option<String>> {
        if requested.len() > 1 {
            return Err(BackupError::Validation(
                "mongodb backups cover one database per run (or all)".into(),
            ));
        }
        let db = match requested.first() {
            Some(db) => Some(db.clone()),
            None => {
                let configured = &self.config()?.database;
                if configured.is_empty() {
                    None
                } else {
                    Some(configured.clone())
                }
            }
        };
        if let Some(db) = &db {
            validate_database_name(db)?;
        }
        Ok(db)
    }
}

impl Default for MongoDbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn bson_u64(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) => v.max(0.0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl EngineAdapter for MongoDbAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::MongoDb
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental: false,
            supports_pitr: true,
            artifact_shape: ArtifactShape::DirectoryTree,
        }
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<()> {
        validate_port(u32::from(Self::port(config)))?;
        let mut options = ClientOptions::parse(Self::connection_uri(config))
            .await
            .map_err(Self::db_err)?;
        options.connect_timeout = Some(config.connect_timeout);
        options.server_selection_timeout = Some(config.connect_timeout);
        let client = Client::with_options(options).map_err(Self::db_err)?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(Self::db_err)?;

        self.client = Some(client);
        self.config = Some(config.clone());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client = None;
        self.config = None;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client()?
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let names = self
            .client()?
            .list_database_names()
            .await
            .map_err(Self::db_err)?;
        Ok(names
            .into_iter()
            .filter(|db| !matches!(db.as_str(), "admin" | "config" | "local"))
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        validate_database_name(database)?;
        let mut names = self
            .client()?
            .database(database)
            .list_collection_names()
            .await
            .map_err(Self::db_err)?;
        names.sort();
        Ok(names)
    }

    async fn table_info(&self, database: &str) -> Result<Vec<TableInfo>> {
        let db = self.client()?.database(database);
        let mut infos = Vec::new();
        for name in self.list_tables(database).await? {
            // collStats `size` is the uncompressed collection size; there
            // is no separate index-length figure worth recording here.
            let stats = db
                .run_command(doc! { "collStats": &name })
                .await
                .map_err(Self::db_err)?;
            infos.push(TableInfo {
                rows: bson_u64(&stats, "count"),
                data_bytes: bson_u64(&stats, "size"),
                index_bytes: bson_u64(&stats, "totalIndexSize"),
                name,
            });
        }
        Ok(infos)
    }

    async fn version(&self) -> Result<String> {
        let info = self
            .client()?
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await
            .map_err(Self::db_err)?;
        Ok(info.get_str("version").unwrap_or("unknown").to_string())
    }

    async fn estimate_size(&self, opts: &BackupOptions) -> Result<u64> {
        let databases = match self.target_database(&opts.databases)? {
            Some(db) => vec![db],
            None => self.list_databases().await?,
        };
        let mut total = 0u64;
        for db in databases {
            let stats = self
                .client()?
                .database(&db)
                .run_command(doc! { "dbStats": 1 })
                .await
                .map_err(Self::db_err)?;
            total += bson_u64(&stats, "dataSize");
        }
        Ok(total)
    }

    async fn dump(
        &self,
        opts: &BackupOptions,
        sink: &mut DumpSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DumpReport> {
        if opts.direct_stream {
            return Err(BackupError::UnsupportedEngine(
                "mongodb cannot stream a dump to stdout; remove the direct-stream request".into(),
            ));
        }
        if opts.tables.len() > 1 {
            return Err(BackupError::Validation(
                "mongodump filters at most one collection per run".into(),
            ));
        }
        for table in opts.tables.iter().chain(&opts.exclude_tables) {
            validate_table_name(table)?;
        }
        let database = self.target_database(&opts.databases)?;

        let spool = TempDir::new()
            .map_err(|e| BackupError::Internal(format!("dump spool directory: {e}")))?;
        let credentials = self.credential_file()?;

        let mut command = self
            .tool("mongodump", credentials.as_ref())?
            .arg("--out")
            .arg(spool.path().display().to_string());

        if let Some(db) = &database {
            command = command.arg("--db").arg(db.clone());
        }
        if let Some(collection) = opts.tables.first() {
            command = command.arg("--collection").arg(collection.clone());
        }
        for excluded in &opts.exclude_tables {
            command = command.arg("--excludeCollection").arg(excluded.clone());
        }
        if opts.consistent {
            // --oplog only applies to full-deployment dumps.
            if database.is_none() {
                command = command.arg("--oplog");
            } else {
                warn!("mongodump --oplog requires a full dump, skipping for single-database run");
            }
        }
        let effective_parallel = if opts.parallel > 1 {
            command = command
                .arg("--numParallelCollections")
                .arg(opts.parallel.to_string());
            opts.parallel
        } else {
            1
        };

        let stderr = run_to_completion(command, cancel, false).await?;
        if !stderr.is_empty() {
            info!(lines = stderr.lines().count(), "mongodump completed");
        }

        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let files = archive::pack_tree(spool.path(), sink)?;
        info!(files, "packed dump tree");

        Ok(DumpReport { effective_parallel })
    }

    async fn restore(
        &self,
        opts: &RestoreOptions,
        source: &mut RestoreSource<'_>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        if !opts.database.is_empty() {
            validate_database_name(&opts.database)?;
        }
        let started_at = chrono::Utc::now();

        // Unpack the tar-encoded tree under a fresh temp dir; the dir (and
        // anything partially unpacked) is removed on every exit path.
        let spool = TempDir::new()
            .map_err(|e| BackupError::Internal(format!("restore spool directory: {e}")))?;
        let files = archive::unpack_tree(&mut *source, spool.path())?;
        info!(files, "unpacked artifact tree");
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let credentials = self.credential_file()?;
        let mut command = self.tool("mongorestore", credentials.as_ref())?;

        let dump_dir: &Path = spool.path();
        let target_dir = if opts.database.is_empty() {
            dump_dir.to_path_buf()
        } else {
            command = command.arg("--db").arg(opts.database.clone());
            dump_dir.join(&opts.database)
        };
        if opts.drop_existing {
            command = command.arg("--drop");
        }
        let effective_parallel = if opts.parallel > 1 {
            command = command
                .arg("--numParallelCollections")
                .arg(opts.parallel.to_string());
            opts.parallel
        } else {
            1
        };
        if let Some(point_in_time) = opts.point_in_time {
            command = command
                .arg("--oplogReplay")
                .arg("--oplogLimit")
                .arg(format!("{}:0", point_in_time.timestamp()));
        }
        command = command.arg(target_dir.display().to_string());

        run_to_completion(command, cancel, true).await?;

        let restored_tables = if opts.database.is_empty() {
            Vec::new()
        } else {
            self.list_tables(&opts.database).await.unwrap_or_default()
        };
        Ok(RestoreReport {
            started_at,
            ended_at: chrono::Utc::now(),
            restored_tables,
            rows_restored: 0,
            effective_parallel,
        })
    }

    async fn validate_restore(&self, opts: &RestoreOptions) -> Result<()> {
        if !opts.database.is_empty() {
            validate_database_name(&opts.database)?;
        }
        for table in &opts.tables {
            validate_table_name(table)?;
        }
        self.ping()
            .await
            .map_err(|e| BackupError::Validation(format!("restore target unreachable: {e}")))
    }
}
