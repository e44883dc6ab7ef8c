use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use dbbackup::codec::sensitive::EncryptionKey;
use dbbackup::engine::{BackupOptions, ConnectionConfig, RestoreOptions};
use dbbackup::{
    BackupRequest, BackupService, CatalogFilter, CodecSpec, Compression, Encryption, EngineKind,
    EngineRegistry, FsCatalog, LocalStorage, Progress, RestoreRequest,
};

#[derive(Parser)]
#[command(name = "dbbackup")]
#[command(about = "Multi-engine database backup and restore")]
#[command(version)]
struct Cli {
    /// Catalog directory (descriptor records)
    #[arg(long, default_value = "./dbbackup/catalog", global = true)]
    catalog_dir: PathBuf,

    /// Local storage root (artifacts)
    #[arg(long, default_value = "./dbbackup/storage", global = true)]
    storage_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Engine: postgres | mysql | mongodb | sqlite
    #[arg(long)]
    engine: EngineKind,

    #[arg(long, default_value = "localhost")]
    host: String,

    /// Engine-default port when omitted
    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long, default_value = "")]
    username: String,

    /// Password; prefer DBBACKUP_PASSWORD over the flag
    #[arg(long, env = "DBBACKUP_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    #[arg(long, default_value = "")]
    database: String,

    /// Database file path (sqlite only)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

impl ConnectionArgs {
    fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            path: self.db_path.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup
    Backup {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Human label for the backup
        #[arg(long)]
        name: Option<String>,

        /// Databases to capture (repeatable)
        #[arg(long = "db")]
        databases: Vec<String>,

        #[arg(long)]
        all_databases: bool,

        /// Tables/collections to include (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Tables/collections to exclude (repeatable)
        #[arg(long = "exclude-table")]
        exclude_tables: Vec<String>,

        /// Engine-appropriate consistent snapshot mode
        #[arg(long)]
        consistent: bool,

        #[arg(long, default_value_t = 1)]
        parallel: u32,

        /// none | gzip | zstd | lz4
        #[arg(long, default_value = "zstd")]
        compression: String,

        #[arg(long)]
        compression_level: Option<i32>,

        /// Encrypt with the 256-bit hex key in DBBACKUP_ENCRYPTION_KEY
        #[arg(long)]
        encrypt: bool,

        /// key=value tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Validate, connect, and estimate without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore a backup by id
    Restore {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(long)]
        id: String,

        /// Target database name
        #[arg(long, default_value = "")]
        into: String,

        #[arg(long)]
        drop_existing: bool,

        #[arg(long, default_value_t = 1)]
        parallel: u32,
    },

    /// List catalog entries
    List {
        #[arg(long)]
        database: Option<String>,

        #[arg(long)]
        engine: Option<EngineKind>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one descriptor as JSON
    Get {
        #[arg(long)]
        id: String,
    },

    /// Delete a backup (record and artifact)
    Delete {
        #[arg(long)]
        id: String,
    },
}

fn parse_compression(s: &str) -> Result<Compression, String> {
    match s {
        "none" => Ok(Compression::None),
        "gzip" => Ok(Compression::Gzip),
        "zstd" => Ok(Compression::Zstd),
        "lz4" => Ok(Compression::Lz4),
        other => Err(format!("unknown compression {other:?}")),
    }
}

fn parse_tags(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut tags = BTreeMap::new();
    for entry in raw {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| format!("tag {entry:?} is not key=value"))?;
        tags.insert(k.to_string(), v.to_string());
    }
    Ok(tags)
}

fn format_bytes(bytes: u64) -> String {
    const UNIT: f64 = 1024.0;
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= UNIT && unit < 5 {
        value /= UNIT;
        unit += 1;
    }
    format!("{value:.2} {}B", ["K", "M", "G", "T", "P"][unit - 1])
}

fn print_progress(p: Progress) {
    if let Some(total) = p.bytes_total {
        eprintln!(
            "[{}] {}% ({} / {})",
            p.stage,
            p.percent,
            format_bytes(p.bytes_done),
            format_bytes(total)
        );
    } else {
        eprintln!("[{}] {}", p.stage, p.message);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let service = BackupService::new(
        Arc::new(EngineRegistry::builtin()),
        Arc::new(FsCatalog::new(&cli.catalog_dir)),
        Arc::new(LocalStorage::new(&cli.storage_dir)),
    );

    // Ctrl-C flips the token; the pipeline reaps subprocesses and cleans
    // partial artifacts before the process exits.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            signal_cancel.cancel();
        }
    });

    let code = match run(cli.command, &service, &cancel).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(
    command: Commands,
    service: &BackupService,
    cancel: &CancellationToken,
) -> dbbackup::Result<()> {
    match command {
        Commands::Backup {
            connection,
            name,
            databases,
            all_databases,
            tables,
            exclude_tables,
            consistent,
            parallel,
            compression,
            compression_level,
            encrypt,
            tags,
            dry_run,
        } => {
            let compression = parse_compression(&compression)
                .map_err(dbbackup::BackupError::Validation)?;
            let encryption_key = if encrypt {
                let hex_key = std::env::var("DBBACKUP_ENCRYPTION_KEY").map_err(|_| {
                    dbbackup::BackupError::Encryption(
                        "DBBACKUP_ENCRYPTION_KEY is not set".into(),
                    )
                })?;
                Some(EncryptionKey::from_hex(&hex_key)?)
            } else {
                None
            };

            let req = BackupRequest {
                name,
                engine: connection.engine,
                connection: connection.config(),
                options: BackupOptions {
                    databases,
                    all_databases,
                    tables,
                    exclude_tables,
                    consistent,
                    parallel,
                    direct_stream: false,
                },
                codec: CodecSpec {
                    compression,
                    compression_level,
                    encryption: if encrypt {
                        Encryption::Aead256
                    } else {
                        Encryption::None
                    },
                },
                encryption_key,
                tags: parse_tags(&tags).map_err(dbbackup::BackupError::Validation)?,
                dry_run,
            };

            let desc = service
                .create_backup(&req, Some(&print_progress), cancel)
                .await?;
            if dry_run {
                println!(
                    "dry run ok: would capture ~{} from {}",
                    format_bytes(desc.raw_size),
                    desc.databases.join(", ")
                );
            } else {
                println!(
                    "{} ({}, raw {}, stored {})",
                    desc.id,
                    desc.engine_kind,
                    format_bytes(desc.raw_size),
                    format_bytes(desc.stored_size)
                );
            }
            Ok(())
        }

        Commands::Restore {
            connection,
            id,
            into,
            drop_existing,
            parallel,
        } => {
            let encryption_key = match std::env::var("DBBACKUP_ENCRYPTION_KEY") {
                Ok(hex_key) => Some(EncryptionKey::from_hex(&hex_key)?),
                Err(_) => None,
            };
            let req = RestoreRequest {
                id,
                connection: connection.config(),
                options: RestoreOptions {
                    database: into,
                    drop_existing,
                    parallel,
                    ..Default::default()
                },
                encryption_key,
            };
            let report = service
                .restore_backup(&req, Some(&print_progress), cancel)
                .await?;
            println!(
                "restored {} table(s) in {}s",
                report.restored_tables.len(),
                (report.ended_at - report.started_at).num_seconds()
            );
            Ok(())
        }

        Commands::List {
            database,
            engine,
            limit,
        } => {
            let filter = CatalogFilter {
                database,
                engine_kind: engine,
                limit,
                ..Default::default()
            };
            for desc in service.list_backups(&filter).await? {
                println!(
                    "{}  {:10}  {:12}  raw {:>10}  stored {:>10}  {}",
                    desc.id,
                    desc.engine_kind.to_string(),
                    format!("{:?}", desc.status).to_lowercase(),
                    format_bytes(desc.raw_size),
                    format_bytes(desc.stored_size),
                    desc.name.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }

        Commands::Get { id } => {
            let desc = service.get_backup(&id).await?;
            let body = serde_json::to_string_pretty(&desc)
                .map_err(|e| dbbackup::BackupError::Internal(e.to_string()))?;
            println!("{body}");
            Ok(())
        }

        Commands::Delete { id } => {
            service.delete_backup(&id).await?;
            println!("deleted {id}");
            Ok(())
        }
    }
}
