//! Compression codec abstraction for downloaded objects.
//!
//! Each codec decompresses a complete downloaded file into memory. Gzip input
//! is decoded as a single stream: bytes after the first gzip member are
//! ignored.

use std::io::Read;
use std::sync::Arc;

use serde::Deserialize;
use snafu::prelude::*;

use crate::error::{CodecSnafu, DecompressionError};

/// Trait for compression codecs that can decompress data.
pub trait CompressionCodec: Send + Sync {
    /// Decompress data fully into memory.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError>;

    /// Human-readable name of this codec (for logging/debugging).
    fn name(&self) -> &'static str;
}

/// Gzip compression codec using flate2.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

impl CompressionCodec for GzipCodec {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .context(CodecSnafu { codec: self.name() })?;
        Ok(buf)
    }

    fn name(&self) -> &'static str {
        "gzip"
    }
}

/// Zstandard compression codec using zstd.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCodec;

impl CompressionCodec for ZstdCodec {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError> {
        zstd::stream::decode_all(data).context(CodecSnafu { codec: self.name() })
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}

/// No-op codec for uncompressed data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl CompressionCodec for NoopCodec {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecompressionError> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Compression format of the objects in a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[default]
    Gzip,
    Zstd,
    None,
}

impl CompressionFormat {
    /// Codec implementing this format.
    pub fn codec(self) -> Arc<dyn CompressionCodec> {
        match self {
            CompressionFormat::Gzip => Arc::new(GzipCodec),
            CompressionFormat::Zstd => Arc::new(ZstdCodec),
            CompressionFormat::None => Arc::new(NoopCodec),
        }
    }
}

#[cfg(test)]
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
