//! Artifact codec: the composed transform every backup stream passes
//! through on its way to storage.
//!
//! Write order: plaintext → compressor → chunked AEAD → checksum tee → sink.
//! Read is the exact inverse. The checksum always covers the outermost
//! (stored) bytes, header included, so it can be verified without any key.
//!
//! The stream is self-describing: a 20-byte header carries the magic, the
//! format version, the compression and encryption ids, and the AEAD base
//! nonce, which is everything a restore needs besides the key itself.

pub mod archive;
pub mod compress;
pub mod encrypt;
pub mod sensitive;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};
use crate::validation::validate_compression_level;
use compress::{CompressReader, CompressWriter};
use encrypt::{DecryptingReader, EncryptingWriter, NONCE_LEN};
use sensitive::EncryptionKey;

pub const MAGIC: [u8; 4] = *b"DBBK";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;

/// Compression algorithm applied to the artifact payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Zstd => 2,
            Compression::Lz4 => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Zstd),
            3 => Some(Compression::Lz4),
            _ => None,
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 6,
            Compression::Zstd => 3,
            Compression::Lz4 => 1,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        };
        f.write_str(s)
    }
}

/// Encryption applied after compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aead-256")]
    Aead256,
}

impl Encryption {
    pub fn id(self) -> u8 {
        match self {
            Encryption::None => 0,
            Encryption::Aead256 => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Encryption::None),
            1 => Some(Encryption::Aead256),
            _ => None,
        }
    }
}

/// The codec parameters recorded in every descriptor. Together with the key
/// these are sufficient to reverse the pipeline; `raw_size` is never needed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub compression: Compression,
    #[serde(default)]
    pub compression_level: Option<i32>,
    pub encryption: Encryption,
}

impl CodecSpec {
    pub fn plain() -> Self {
        Self {
            compression: Compression::None,
            compression_level: None,
            encryption: Encryption::None,
        }
    }

    pub fn effective_level(&self) -> i32 {
        self.compression_level
            .unwrap_or_else(|| self.compression.default_level())
    }
}

/// Result of closing an [`ArtifactWriter`].
#[derive(Debug, Clone)]
pub struct CodecSummary {
    /// Hex SHA-256 over the stored bytes.
    pub checksum: String,
    /// Plaintext bytes fed into the codec.
    pub raw_size: u64,
    /// Bytes actually written to the sink.
    pub stored_size: u64,
}

/// Checksum tee: hashes and counts everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finalize(mut self) -> io::Result<(String, u64, W)> {
        self.inner.flush()?;
        let digest = hex::encode(self.hasher.finalize());
        Ok((digest, self.written, self.inner))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a full stream without transforming it. Used to verify stored bytes
/// against a descriptor checksum before a restore touches the engine.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

type Sink = HashingWriter<Box<dyn Write + Send>>;

enum CipherWriter {
    Plain(Sink),
    Aead(EncryptingWriter<Sink>),
}

impl CipherWriter {
    fn finish(self) -> io::Result<Sink> {
        match self {
            CipherWriter::Plain(w) => Ok(w),
            CipherWriter::Aead(w) => w.finish(),
        }
    }
}

impl Write for CipherWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CipherWriter::Plain(w) => w.write(buf),
            CipherWriter::Aead(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CipherWriter::Plain(w) => w.flush(),
            CipherWriter::Aead(w) => w.flush(),
        }
    }
}

/// Streaming artifact encoder. Wraps a raw sink; callers write plaintext
/// dump bytes and must call [`ArtifactWriter::finish`] to seal trailers and
/// obtain the checksum. Peak memory stays at one compressor window plus one
/// AEAD frame regardless of artifact size.
pub struct ArtifactWriter {
    comp: Option<CompressWriter<CipherWriter>>,
    raw_size: u64,
}

impl ArtifactWriter {
    pub fn new(
        sink: Box<dyn Write + Send>,
        spec: &CodecSpec,
        key: Option<&EncryptionKey>,
    ) -> Result<Self> {
        if let Some(level) = spec.compression_level {
            validate_compression_level(spec.compression, level)?;
        }

        let mut tee = HashingWriter::new(sink);

        let nonce = match spec.encryption {
            Encryption::None => [0u8; NONCE_LEN],
            Encryption::Aead256 => encrypt::generate_nonce(),
        };
        write_header(&mut tee, spec, &nonce)
            .map_err(|e| BackupError::Internal(format!("artifact header: {e}")))?;

        let cipher = match spec.encryption {
            Encryption::None => CipherWriter::Plain(tee),
            Encryption::Aead256 => {
                let key = key.ok_or_else(|| {
                    BackupError::Encryption("encryption requested but no key provided".into())
                })?;
                CipherWriter::Aead(EncryptingWriter::new(tee, key, nonce))
            }
        };

        let comp = CompressWriter::new(cipher, spec.compression, spec.effective_level())
            .map_err(|e| BackupError::Compression(e.to_string()))?;

        Ok(Self {
            comp: Some(comp),
            raw_size: 0,
        })
    }

    pub fn finish(mut self) -> Result<CodecSummary> {
        let comp = self.comp.take().expect("finish called once");
        let cipher = comp
            .finish()
            .map_err(|e| BackupError::Compression(e.to_string()))?;
        let tee = cipher
            .finish()
            .map_err(|e| BackupError::Encryption(e.to_string()))?;
        let (checksum, stored_size, _sink) = tee
            .finalize()
            .map_err(|e| BackupError::Internal(format!("artifact flush: {e}")))?;
        Ok(CodecSummary {
            checksum,
            raw_size: self.raw_size,
            stored_size,
        })
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let comp = self
            .comp
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already finished"))?;
        let n = comp.write(buf)?;
        self.raw_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.comp.as_mut() {
            Some(comp) => comp.flush(),
            None => Ok(()),
        }
    }
}

fn write_header<W: Write>(w: &mut W, spec: &CodecSpec, nonce: &[u8; NONCE_LEN]) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = FORMAT_VERSION;
    header[5] = spec.compression.id();
    header[6] = spec.encryption.id();
    header[7] = 0; // reserved
    header[8..].copy_from_slice(nonce);
    w.write_all(&header)
}

type Source = Box<dyn Read + Send>;

enum CipherReader {
    Plain(Source),
    Aead(DecryptingReader<Source>),
}

impl Read for CipherReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CipherReader::Plain(r) => r.read(buf),
            CipherReader::Aead(r) => r.read(buf),
        }
    }
}

/// Streaming artifact decoder: parses the header and reverses the write
/// pipeline. The header alone (plus the key) is sufficient; no descriptor
/// fields are consulted.
pub struct ArtifactReader {
    inner: CompressReader<CipherReader>,
    spec: CodecSpec,
}

impl ArtifactReader {
    pub fn open(mut source: Source, key: Option<&EncryptionKey>) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        source
            .read_exact(&mut header)
            .map_err(|e| BackupError::CorruptArtifact(format!("artifact header: {e}")))?;

        if header[..4] != MAGIC {
            return Err(BackupError::CorruptArtifact("bad artifact magic".into()));
        }
        if header[4] != FORMAT_VERSION {
            return Err(BackupError::CorruptArtifact(format!(
                "unsupported artifact format version {}",
                header[4]
            )));
        }
        let compression = Compression::from_id(header[5]).ok_or_else(|| {
            BackupError::CorruptArtifact(format!("unknown compression id {}", header[5]))
        })?;
        let encryption = Encryption::from_id(header[6]).ok_or_else(|| {
            BackupError::CorruptArtifact(format!("unknown encryption id {}", header[6]))
        })?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[8..]);

        let cipher = match encryption {
            Encryption::None => CipherReader::Plain(source),
            Encryption::Aead256 => {
                let key = key.ok_or_else(|| {
                    BackupError::Encryption("artifact is encrypted but no key provided".into())
                })?;
                CipherReader::Aead(DecryptingReader::new(source, key, nonce))
            }
        };

        let inner = CompressReader::new(cipher, compression)
            .map_err(|e| BackupError::Compression(e.to_string()))?;

        Ok(Self {
            inner,
            spec: CodecSpec {
                compression,
                compression_level: None,
                encryption,
            },
        })
    }

    /// Codec parameters as recorded in the stream header.
    pub fn spec(&self) -> &CodecSpec {
        &self.spec
    }
}

impl Read for ArtifactReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Map a failure while reading decoded artifact bytes to an error kind.
/// Authentication and framing failures surface as `InvalidData` from the
/// codec layers and mean the stored bytes cannot be what the writer sealed.
pub fn map_read_error(e: io::Error) -> BackupError {
    if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof {
        BackupError::CorruptArtifact(e.to_string())
    } else {
        BackupError::Internal(format!("artifact read: {e}"))
    }
}
