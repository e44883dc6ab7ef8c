//! Identifier and path guards.
//!
//! Every externally-sourced identifier passes through these checks before it
//! can reach a subprocess argument list, a storage key, or a catalog path.
//! All functions are pure; failure is always `BackupError::Validation`.

use std::path::{Component, Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::codec::Compression;

const MAX_DATABASE_NAME: usize = 64;
const MAX_TABLE_NAME: usize = 128;

/// Validate a database name: `[A-Za-z0-9_-]`, 1..=64 chars, no leading
/// dash (flag injection) or dot (hidden files).
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackupError::Validation("database name cannot be empty".into()));
    }
    if name.len() > MAX_DATABASE_NAME {
        return Err(BackupError::Validation(format!(
            "database name too long (max {MAX_DATABASE_NAME} characters)"
        )));
    }
    if name.starts_with('-') {
        return Err(BackupError::Validation(
            "database name cannot start with dash".into(),
        ));
    }
    if name.starts_with('.') {
        return Err(BackupError::Validation(
            "database name cannot start with dot".into(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(BackupError::Validation(format!(
            "database name {name:?} contains invalid characters (only alphanumeric, underscore, and hyphen allowed)"
        )));
    }
    Ok(())
}

/// Validate a table or collection name. Same policy as database names but
/// interior dots are allowed for `schema.table`, max 128 chars.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackupError::Validation("table name cannot be empty".into()));
    }
    if name.len() > MAX_TABLE_NAME {
        return Err(BackupError::Validation(format!(
            "table name too long (max {MAX_TABLE_NAME} characters)"
        )));
    }
    if name.starts_with('-') {
        return Err(BackupError::Validation(
            "table name cannot start with dash".into(),
        ));
    }
    if name.starts_with('.') {
        return Err(BackupError::Validation(
            "table name cannot start with dot".into(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(BackupError::Validation(format!(
            "table name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a backup id against the canonical format
/// `backup-YYYY-MM-DD-HH-MM-SS-<8 hex>`. Rejects path separators and `..`
/// so an id can never escape the catalog or storage root.
pub fn validate_backup_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BackupError::Validation("backup id cannot be empty".into()));
    }
    if id.contains("..") {
        return Err(BackupError::Validation("backup id cannot contain '..'".into()));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(BackupError::Validation(
            "backup id cannot contain path separators".into(),
        ));
    }
    if !matches_backup_id(id) {
        return Err(BackupError::Validation(format!(
            "backup id {id:?} has invalid format"
        )));
    }
    Ok(())
}

// ^backup-\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}-[a-f0-9]{8}$, byte-checked.
fn matches_backup_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("backup-") else {
        return false;
    };
    let b = rest.as_bytes();
    // 4-2-2-2-2-2 digit groups joined by dashes, then a dash and 8 hex.
    let groups: [usize; 6] = [4, 2, 2, 2, 2, 2];
    let mut i = 0;
    for (n, len) in groups.iter().enumerate() {
        if b.len() < i + len {
            return false;
        }
        if !b[i..i + len].iter().all(u8::is_ascii_digit) {
            return false;
        }
        i += len;
        if n < groups.len() - 1 {
            if b.get(i) != Some(&b'-') {
                return false;
            }
            i += 1;
        }
    }
    if b.get(i) != Some(&b'-') {
        return false;
    }
    i += 1;
    let suffix = &b[i..];
    suffix.len() == 8
        && suffix
            .iter()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c))
}

/// Lexically clean a path and, when `base` is non-empty, reject any path
/// whose absolute form escapes `base`.
pub fn sanitize_path(path: &str, base: &str) -> Result<PathBuf> {
    let cleaned = clean_path(Path::new(path));

    if !base.is_empty() {
        let abs_base = absolutize(Path::new(base))?;
        let abs_path = absolutize(&cleaned)?;
        if !abs_path.starts_with(&abs_base) {
            return Err(BackupError::Validation(format!(
                "path traversal detected: path must be within {base}"
            )));
        }
    }

    Ok(cleaned)
}

// Lexical clean: resolve `.` and `..` without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean_path(path));
    }
    let cwd = std::env::current_dir()
        .map_err(|e| BackupError::Validation(format!("invalid base directory: {e}")))?;
    Ok(clean_path(&cwd.join(path)))
}

/// Validate a TCP port.
pub fn validate_port(port: u32) -> Result<()> {
    if port == 0 || port > 65535 {
        return Err(BackupError::Validation(format!(
            "port must be between 1 and 65535, got {port}"
        )));
    }
    Ok(())
}

/// Validate a compression level for the given algorithm.
pub fn validate_compression_level(compression: Compression, level: i32) -> Result<()> {
    let ok = match compression {
        Compression::None => true,
        Compression::Gzip => level == -1 || (1..=9).contains(&level),
        Compression::Zstd => (1..=22).contains(&level),
        Compression::Lz4 => (1..=12).contains(&level),
    };
    if !ok {
        return Err(BackupError::Validation(format!(
            "invalid {compression} compression level {level}"
        )));
    }
    Ok(())
}

/// Mask sensitive values (passwords, tokens) for logging.
pub fn mask_sensitive(s: &str) -> String {
    if s.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}****{}", &s[..4], &s[s.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_database_names() {
        for name in ["shop", "my_db", "db-01", "A1", &"x".repeat(64)] {
            assert!(validate_database_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_database_names() {
        for name in [
            "",
            "-leading-dash",
            ".hidden",
            "has space",
            "semi;colon",
            "shop'; DROP TABLE users--",
            "a/b",
            "dotted.name",
            &"x".repeat(65),
        ] {
            assert!(validate_database_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn test_accepted_names_stay_in_charset() {
        // Property 1: anything accepted is 1..=64 chars of [A-Za-z0-9_-].
        for name in ["orders", "a-b_c9", "Z"] {
            validate_database_name(name).unwrap();
            assert!(!name.is_empty() && name.len() <= 64);
            assert!(name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
        }
    }

    #[test]
    fn test_table_names_allow_interior_dot() {
        assert!(validate_table_name("public.orders").is_ok());
        assert!(validate_table_name(".hidden").is_err());
        assert!(validate_table_name("users; --").is_err());
        assert!(validate_table_name(&"t".repeat(129)).is_err());
    }

    #[test]
    fn test_valid_backup_id() {
        assert!(validate_backup_id("backup-2025-01-01-00-00-00-aaaaaaaa").is_ok());
        assert!(validate_backup_id("backup-2025-12-31-23-59-59-0f3c9d2e").is_ok());
    }

    #[test]
    fn test_backup_id_rejects_traversal() {
        // Scenario: id smuggling a path escape must fail before any FS access.
        assert!(validate_backup_id("backup-2025-01-01-00-00-00-aaaaaaaa/../etc").is_err());
        assert!(validate_backup_id("../backup-2025-01-01-00-00-00-aaaaaaaa").is_err());
        assert!(validate_backup_id("backup-2025-01-01-00-00-00-aaaaaaaa\\x").is_err());
    }

    #[test]
    fn test_backup_id_rejects_malformed() {
        for id in [
            "",
            "backup-2025-01-01-00-00-00",          // missing suffix
            "backup-2025-01-01-00-00-00-AAAAAAAA", // uppercase hex
            "backup-2025-01-01-00-00-00-aaaaaaa",  // 7 hex chars
            "backup-25-01-01-00-00-00-aaaaaaaa",   // short year
            "snapshot-2025-01-01-00-00-00-aaaaaaaa",
            "backup-2025-01-01-00-00-00-aaaaaaaa-extra",
        ] {
            assert!(validate_backup_id(id).is_err(), "{id}");
        }
    }

    #[test]
    fn test_sanitize_path_within_base() {
        let base = std::env::temp_dir();
        let base_str = base.to_str().unwrap();
        let p = sanitize_path(&format!("{base_str}/catalog/x.json"), base_str).unwrap();
        assert!(absolutize(&p).unwrap().starts_with(&base));
    }

    #[test]
    fn test_sanitize_path_rejects_escape() {
        let base = std::env::temp_dir();
        let base_str = base.to_str().unwrap();
        assert!(sanitize_path(&format!("{base_str}/../etc/passwd"), base_str).is_err());
        assert!(sanitize_path("/etc/passwd", base_str).is_err());
    }

    #[test]
    fn test_sanitize_path_lexical_clean() {
        let p = sanitize_path("a/./b/../c", "").unwrap();
        assert_eq!(p, PathBuf::from("a/c"));
    }

    #[test]
    fn test_compression_levels() {
        assert!(validate_compression_level(Compression::Gzip, 6).is_ok());
        assert!(validate_compression_level(Compression::Gzip, -1).is_ok());
        assert!(validate_compression_level(Compression::Gzip, 10).is_err());
        assert!(validate_compression_level(Compression::Zstd, 22).is_ok());
        assert!(validate_compression_level(Compression::Zstd, 0).is_err());
        assert!(validate_compression_level(Compression::Lz4, 12).is_ok());
        assert!(validate_compression_level(Compression::Lz4, 13).is_err());
        assert!(validate_compression_level(Compression::None, 99).is_ok());
    }

    #[test]
    fn test_port_bounds() {
        assert!(validate_port(5432).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
    }

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("secret"), "****");
        assert_eq!(mask_sensitive("supersecretpass"), "supe****pass");
    }
}
