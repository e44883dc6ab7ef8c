pub mod catalog;
pub mod codec;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod restore;
pub mod storage;
pub mod validation;

pub use catalog::{BackupDescriptor, BackupStatus, CatalogFilter, FsCatalog};
pub use codec::{CodecSpec, Compression, Encryption};
pub use engine::{EngineKind, EngineRegistry};
pub use error::{is_retryable, BackupError, ErrorKind, Result};
pub use pipeline::{BackupRequest, BackupService, Progress, ProgressFn, Stage};
pub use restore::RestoreRequest;
pub use storage::{local::LocalStorage, Storage};
