use thiserror::Error;

/// Error kinds surfaced by the backup core.
///
/// Every failure is tagged with one of these kinds so that callers (CLI,
/// schedulers) can map it to an exit code or a retry decision without
/// parsing messages.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unsupported: {0}")]
    UnsupportedEngine(String),

    #[error("dump failed: {message}")]
    DumpFailed {
        message: String,
        /// Tail of the dump tool's stderr, when a subprocess was involved.
        stderr: Option<String>,
    },

    #[error("restore failed: {message}")]
    RestoreFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Stable tag for an error kind. Persisted in failed descriptors and mapped
/// to process exit codes by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Connection,
    UnsupportedEngine,
    DumpFailed,
    RestoreFailed,
    Storage,
    Catalog,
    Compression,
    Encryption,
    CorruptArtifact,
    Cancelled,
    NotFound,
    Internal,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Validation(_) => ErrorKind::Validation,
            BackupError::Connection(_) => ErrorKind::Connection,
            BackupError::UnsupportedEngine(_) => ErrorKind::UnsupportedEngine,
            BackupError::DumpFailed { .. } => ErrorKind::DumpFailed,
            BackupError::RestoreFailed { .. } => ErrorKind::RestoreFailed,
            BackupError::Storage(_) => ErrorKind::Storage,
            BackupError::Catalog(_) => ErrorKind::Catalog,
            BackupError::Compression(_) => ErrorKind::Compression,
            BackupError::Encryption(_) => ErrorKind::Encryption,
            BackupError::CorruptArtifact(_) => ErrorKind::CorruptArtifact,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code for CLI glue: 0 success, 1 validation, 2 connection,
    /// 3 engine dump/restore, 4 storage, 5 catalog, 6 cancelled, 7 corrupt.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 1,
            ErrorKind::Connection => 2,
            ErrorKind::UnsupportedEngine
            | ErrorKind::DumpFailed
            | ErrorKind::RestoreFailed => 3,
            ErrorKind::Storage => 4,
            ErrorKind::Catalog | ErrorKind::NotFound => 5,
            ErrorKind::Cancelled => 6,
            ErrorKind::CorruptArtifact => 7,
            ErrorKind::Compression | ErrorKind::Encryption | ErrorKind::Internal => 3,
        }
    }
}

/// Whether a caller-side retry could plausibly succeed.
///
/// Only storage errors and network-flavored connection errors qualify; the
/// core itself never retries.
pub fn is_retryable(err: &BackupError) -> bool {
    match err {
        BackupError::Storage(_) => true,
        BackupError::Connection(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("timed out")
                || msg.contains("timeout")
                || msg.contains("refused")
                || msg.contains("reset")
                || msg.contains("unreachable")
        }
        _ => false,
    }
}
