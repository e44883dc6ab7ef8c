//! Directory-tree artifacts.
//!
//! Document-engine dumps are directory trees; the codec only handles single
//! streams, so trees are serialized as a POSIX ustar archive of regular
//! files (no symlinks, no special types) before compression and encryption.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path};

use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::error::{BackupError, Result};

/// Serialize the tree rooted at `root` into `sink` as a ustar stream.
/// Entries are relative paths in walk order; only regular files are packed.
/// Returns the number of files archived.
pub fn pack_tree<W: Write>(root: &Path, sink: W) -> Result<u64> {
    let mut builder = Builder::new(sink);
    let mut files = 0u64;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry =
            entry.map_err(|e| BackupError::Internal(format!("walking dump tree: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| BackupError::Internal(format!("dump tree entry: {e}")))?;

        let mut file = File::open(entry.path())
            .map_err(|e| BackupError::Internal(format!("open {}: {e}", rel.display())))?;
        let meta = file
            .metadata()
            .map_err(|e| BackupError::Internal(format!("stat {}: {e}", rel.display())))?;

        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, rel, &mut file)
            .map_err(|e| BackupError::Internal(format!("archive {}: {e}", rel.display())))?;
        files += 1;
    }

    builder
        .into_inner()
        .map_err(|e| BackupError::Internal(format!("archive trailer: {e}")))?
        .flush()
        .map_err(|e| BackupError::Internal(format!("archive flush: {e}")))?;
    Ok(files)
}

/// Unpack a ustar stream into `dest`. Every entry must be a regular file
/// (or directory) with a relative, traversal-free path; anything else marks
/// the artifact corrupt. Returns the number of files written.
pub fn unpack_tree<R: Read>(source: R, dest: &Path) -> Result<u64> {
    let mut archive = Archive::new(source);
    let mut files = 0u64;

    let entries = archive
        .entries()
        .map_err(|e| BackupError::CorruptArtifact(format!("archive entries: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BackupError::CorruptArtifact(format!("archive entry: {e}")))?;

        let entry_type = entry.header().entry_type();
        if !matches!(entry_type, EntryType::Regular | EntryType::Directory) {
            return Err(BackupError::CorruptArtifact(format!(
                "archive contains unsupported entry type {entry_type:?}"
            )));
        }

        let path = entry
            .path()
            .map_err(|e| BackupError::CorruptArtifact(format!("archive entry path: {e}")))?
            .into_owned();
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BackupError::CorruptArtifact(format!(
                "archive entry escapes the unpack root: {}",
                path.display()
            )));
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| BackupError::CorruptArtifact(format!("unpack {}: {e}", path.display())))?;
        if unpacked && entry_type == EntryType::Regular {
            files += 1;
        }
    }

    Ok(files)
}
