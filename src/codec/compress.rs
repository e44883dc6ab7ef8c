//! Streaming compression wrappers for the artifact codec.
//!
//! Each algorithm keeps its library framing (gzip member, zstd frame, lz4
//! frame) so the stored payload is recognizable and self-delimiting.

use std::io::{self, BufReader, Read, Write};

use crate::codec::Compression;

/// Writer-side compressor over an arbitrary sink.
pub enum CompressWriter<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4::Encoder<W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(sink: W, compression: Compression, level: i32) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => CompressWriter::None(sink),
            Compression::Gzip => {
                let level = if level < 0 {
                    flate2::Compression::default()
                } else {
                    flate2::Compression::new(level as u32)
                };
                CompressWriter::Gzip(flate2::write::GzEncoder::new(sink, level))
            }
            Compression::Zstd => {
                CompressWriter::Zstd(zstd::stream::write::Encoder::new(sink, level)?)
            }
            Compression::Lz4 => CompressWriter::Lz4(
                lz4::EncoderBuilder::new()
                    .level(level as u32)
                    .build(sink)?,
            ),
        })
    }

    /// Flush algorithm trailers and hand back the sink.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressWriter::None(w) => Ok(w),
            CompressWriter::Gzip(enc) => enc.finish(),
            CompressWriter::Zstd(enc) => enc.finish(),
            CompressWriter::Lz4(enc) => {
                let (w, result) = enc.finish();
                result?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::None(w) => w.write(buf),
            CompressWriter::Gzip(w) => w.write(buf),
            CompressWriter::Zstd(w) => w.write(buf),
            CompressWriter::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::None(w) => w.flush(),
            CompressWriter::Gzip(w) => w.flush(),
            CompressWriter::Zstd(w) => w.flush(),
            CompressWriter::Lz4(w) => w.flush(),
        }
    }
}

/// Reader-side decompressor, the inverse of [`CompressWriter`].
pub enum CompressReader<R: Read> {
    None(R),
    Gzip(flate2::read::GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
    Lz4(lz4::Decoder<R>),
}

impl<R: Read> CompressReader<R> {
    pub fn new(source: R, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => CompressReader::None(source),
            Compression::Gzip => CompressReader::Gzip(flate2::read::GzDecoder::new(source)),
            Compression::Zstd => {
                CompressReader::Zstd(zstd::stream::read::Decoder::new(source)?)
            }
            Compression::Lz4 => CompressReader::Lz4(lz4::Decoder::new(source)?),
        })
    }
}

impl<R: Read> Read for CompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CompressReader::None(r) => r.read(buf),
            CompressReader::Gzip(r) => r.read(buf),
            CompressReader::Zstd(r) => r.read(buf),
            CompressReader::Lz4(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: Compression, level: i32, data: &[u8]) -> Vec<u8> {
        let mut w = CompressWriter::new(Vec::new(), compression, level).unwrap();
        w.write_all(data).unwrap();
        let stored = w.finish().unwrap();

        let mut r = CompressReader::new(stored.as_slice(), compression).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_none_is_passthrough() {
        let data = b"uncompressed bytes";
        let mut w = CompressWriter::new(Vec::new(), Compression::None, 0).unwrap();
        w.write_all(data).unwrap();
        assert_eq!(w.finish().unwrap(), data);
    }

    #[test]
    fn test_gzip_roundtrip_and_shrink() {
        let data = vec![b'a'; 256 * 1024];
        let mut w = CompressWriter::new(Vec::new(), Compression::Gzip, 6).unwrap();
        w.write_all(&data).unwrap();
        let stored = w.finish().unwrap();
        assert!(stored.len() < data.len());

        let mut r = CompressReader::new(stored.as_slice(), Compression::Gzip).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_gzip_library_default_level() {
        let data = b"level -1 means library default";
        assert_eq!(roundtrip(Compression::Gzip, -1, data), data);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        assert_eq!(roundtrip(Compression::Zstd, 3, &data), data);
    }

    #[test]
    fn test_lz4_roundtrip() {
        let data = vec![0x42; 300_000];
        assert_eq!(roundtrip(Compression::Lz4, 1, &data), data);
    }

    #[test]
    fn test_empty_input() {
        for c in [Compression::Gzip, Compression::Zstd, Compression::Lz4] {
            assert!(roundtrip(c, c.default_level(), b"").is_empty(), "{c}");
        }
    }

    #[test]
    fn test_garbage_input_fails() {
        let garbage = b"definitely not a zstd frame";
        let mut r = CompressReader::new(&garbage[..], Compression::Zstd).unwrap();
        assert!(r.read_to_end(&mut Vec::new()).is_err());
    }
}
