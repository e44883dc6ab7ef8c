//! Wrapper for encryption key material that is zeroized on drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BackupError, Result};

pub const KEY_LEN: usize = 32;

/// A 256-bit encryption key, wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Accept any key material of at least 32 bytes; the first 32 bytes are
    /// used. Shorter input is an `Encryption` error.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() < KEY_LEN {
            return Err(BackupError::Encryption(format!(
                "encryption key too short: minimum {KEY_LEN} bytes required, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&slice[..KEY_LEN]);
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded key (64+ hex chars).
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| BackupError::Encryption(format!("invalid hex key: {e}")))?;
        Self::from_slice(&raw)
    }

    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key_rejected() {
        assert!(EncryptionKey::from_slice(&[0u8; 31]).is_err());
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(EncryptionKey::from_slice(&[0u8; 48]).is_ok());
    }

    #[test]
    fn test_from_hex() {
        let key = EncryptionKey::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key.as_bytes()[0], 0xab);
        assert!(EncryptionKey::from_hex("zz").is_err());
        assert!(EncryptionKey::from_hex(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = EncryptionKey::generate();
        assert_eq!(format!("{key:?}"), "EncryptionKey(****)");
    }
}
