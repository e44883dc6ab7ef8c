//! MySQL adapter (relational-B).
//!
//! Same shape as the PostgreSQL adapter: sqlx pool for metadata, a dump
//! subprocess streaming SQL to stdout (`mysqldump`), `mysql` on stdin for
//! restore. The password travels via `MYSQL_PWD` only.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::process::{run_dump_to_sink, run_restore_from_source, ToolCommand};
use super::{
    ArtifactShape, BackupOptions, Capabilities, ConnectionConfig, DumpReport, DumpSink,
    EngineAdapter, EngineKind, RestoreOptions, RestoreReport, RestoreSource,
};
use crate::catalog::TableInfo;
use crate::error::{BackupError, Result};
use crate::validation::{
    mask_sensitive, validate_database_name, validate_port, validate_table_name,
};

const DEFAULT_PORT: u16 = 3306;

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

pub struct MySqlAdapter {
    pool: Option<MySqlPool>,
    config: Option<ConnectionConfig>,
}

impl MySqlAdapter {
    pub fn new() -> Self {
        Self {
            pool: None,
            config: None,
        }
    }

    fn pool(&self) -> Result<&MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| BackupError::Connection("not connected to mysql".into()))
    }

    fn config(&self) -> Result<&ConnectionConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| BackupError::Connection("not connected to mysql".into()))
    }

    fn port(config: &ConnectionConfig) -> u16 {
        if config.port == 0 {
            DEFAULT_PORT
        } else {
            config.port
        }
    }

    fn connection_url(config: &ConnectionConfig) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            config.username,
            config.password,
            config.host,
            Self::port(config),
            config.database,
        )
    }

    fn tool(&self, program: &str) -> Result<ToolCommand> {
        let config = self.config()?;
        Ok(ToolCommand::new(program)
            .args([
                format!("--host={}", config.host),
                format!("--port={}", Self::port(config)),
                format!("--user={}", config.username),
            ])
            .env("MYSQL_PWD", config.password.clone()))
    }

    fn db_err(e: sqlx::Error) -> BackupError {
        BackupError::Connection(format!("mysql: {e}"))
    }
}

impl Default for MySqlAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_incremental: false,
            supports_pitr: false,
            artifact_shape: ArtifactShape::SingleStream,
        }
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<()> {
        validate_port(u32::from(Self::port(config)))?;
        tracing::debug!(
            host = %config.host,
            port = Self::port(config),
            user = %config.username,
            password = %mask_sensitive(&config.password),
            "connecting to mysql"
        );
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.connect_timeout)
            .connect(&Self::connection_url(config))
            .await
            .map_err(Self::db_err)?;
        self.pool = Some(pool);
        self.config = Some(config.clone());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        self.config = None;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool()?)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let all = sqlx::query_scalar::<_, String>("SHOW DATABASES")
            .fetch_all(self.pool()?)
            .await
            .map_err(Self::db_err)?;
        Ok(all
            .into_iter()
            .filter(|db| !SYSTEM_SCHEMAS.contains(&db.as_str()))
            .collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        validate_database_name(database)?;
        sqlx::query_scalar::<_, String>(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = ? ORDER BY table_name",
        )
        .bind(database)
        .fetch_all(self.pool()?)
        .await
        .map_err(Self::db_err)
    }

    async fn table_info(&self, database: &str) -> Result<Vec<TableInfo>> {
        validate_database_name(database)?;
        let rows = sqlx::query_as::<_, (String, i64, i64, i64)>(
            r#"
            SELECT table_name,
                   CAST(COALESCE(table_rows, 0) AS SIGNED),
                   CAST(COALESCE(data_length, 0) AS SIGNED),
                   CAST(COALESCE(index_length, 0) AS SIGNED)
            FROM information_schema.tables
            WHERE table_schema = ?
            ORDER BY table_name
            "#,
        )
        .bind(database)
        .fetch_all(self.pool()?)
        .await
        .map_err(Self::db_err)?;

        Ok(rows
            .into_iter()
            .map(|(name, rows, data, index)| TableInfo {
                name,
                rows: rows.max(0) as u64,
                data_bytes: data.max(0) as u64,
                index_bytes: index.max(0) as u64,
            })
            .collect())
    }

    async fn version(&self) -> Result<String> {
        sqlx::query_scalar::<_, String>("SELECT VERSION()")
            .fetch_one(self.pool()?)
            .await
            .map_err(Self::db_err)
    }

    async fn estimate_size(&self, opts: &BackupOptions) -> Result<u64> {
        let databases = if opts.all_databases {
            self.list_databases().await?
        } else if opts.databases.is_empty() {
            vec![self.config()?.database.clone()]
        } else {
            opts.databases.clone()
        };
        let mut total = 0u64;
        for db in &databases {
            validate_database_name(db)?;
            let size = sqlx::query_scalar::<_, i64>(
                "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) \
                 FROM information_schema.tables WHERE table_schema = ?",
            )
            .bind(db)
            .fetch_one(self.pool()?)
            .await
            .map_err(Self::db_err)?;
            total += size.max(0) as u64;
        }
        Ok(total)
    }

    async fn dump(
        &self,
        opts: &BackupOptions,
        sink: &mut DumpSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<DumpReport> {
        for db in &opts.databases {
            validate_database_name(db)?;
        }
        for table in opts.tables.iter().chain(&opts.exclude_tables) {
            validate_table_name(table)?;
        }

        let mut command = self
            .tool("mysqldump")?
            .args(["--routines", "--triggers", "--events", "--skip-lock-tables"]);

        if opts.consistent {
            command = command.arg("--single-transaction");
        }

        let primary_db = opts
            .databases
            .first()
            .cloned()
            .unwrap_or_else(|| self.config().map(|c| c.database.clone()).unwrap_or_default());

        if opts.all_databases {
            command = command.arg("--all-databases");
        } else if opts.databases.len() > 1 {
            command = command.arg("--databases").args(opts.databases.clone());
        } else {
            validate_database_name(&primary_db)?;
            command = command.arg(primary_db.clone());
            // Table selection only applies to a single-database dump.
            command = command.args(opts.tables.clone());
        }

        for table in &opts.exclude_tables {
            command = command.arg(format!("--ignore-table={primary_db}.{table}"));
        }

        // mysqldump has no parallel mode.
        if opts.parallel > 1 {
            info!(
                requested = opts.parallel,
                "mysqldump has no parallel dump mode, using serial"
            );
        }

        run_dump_to_sink(command, sink, cancel).await?;
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
        validate_database_name(&opts.database)?;
        let started_at = chrono::Utc::now();

        let command = self.tool("mysql")?.arg(opts.database.clone());
        run_restore_from_source(command, source, cancel).await?;

        let restored_tables = self.list_tables(&opts.database).await.unwrap_or_default();
        Ok(RestoreReport {
            started_at,
            ended_at: chrono::Utc::now(),
            restored_tables,
            rows_restored: 0,
            effective_parallel: 1,
        })
    }

    async fn validate_restore(&self, opts: &RestoreOptions) -> Result<()> {
        validate_database_name(&opts.database)?;
        for table in &opts.tables {
            validate_table_name(table)?;
        }
        self.ping()
            .await
            .map_err(|e| BackupError::Validation(format!("restore target unreachable: {e}")))
    }
}
