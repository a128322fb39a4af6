//! Payload compression codecs for CascadeMQ messages
//!
//! Message metadata names the codec the producer applied; the consumer looks
//! the codec up by wire id and restores the original payload before any
//! checksum verification or batch splitting happens.

use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Unsupported compression type: {0}")]
    UnsupportedType(u8),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Compression types as defined in the CascadeMQ wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
    Zlib = 2,
    Zstd = 3,
    Snappy = 4,
}

impl TryFrom<u8> for CompressionType {
    type Error = CompressionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Zlib),
            3 => Ok(CompressionType::Zstd),
            4 => Ok(CompressionType::Snappy),
            _ => Err(CompressionError::UnsupportedType(value)),
        }
    }
}

impl From<CompressionType> for u8 {
    fn from(compression_type: CompressionType) -> Self {
        compression_type as u8
    }
}

/// Codec provider resolving a wire compression type to its implementation
#[derive(Debug, Default)]
pub struct CompressionProvider;

impl CompressionProvider {
    pub fn new() -> Self {
        Self
    }

    /// Compress data using the specified compression type
    pub fn encode(
        &self,
        data: &[u8],
        compression_type: CompressionType,
    ) -> Result<Bytes, CompressionError> {
        match compression_type {
            CompressionType::None => Ok(Bytes::copy_from_slice(data)),
            CompressionType::Lz4 => self.encode_lz4(data),
            CompressionType::Zlib => self.encode_zlib(data),
            CompressionType::Zstd => self.encode_zstd(data),
            CompressionType::Snappy => self.encode_snappy(data),
        }
    }

    /// Decompress a payload to exactly `uncompressed_size` bytes.
    ///
    /// A decoded payload of any other length is reported as a decompression
    /// failure; the size recorded in the message metadata is authoritative.
    pub fn decode(
        &self,
        payload: &[u8],
        compression_type: CompressionType,
        uncompressed_size: usize,
    ) -> Result<Bytes, CompressionError> {
        let decoded = match compression_type {
            CompressionType::None => Bytes::copy_from_slice(payload),
            CompressionType::Lz4 => self.decode_lz4(payload, uncompressed_size)?,
            CompressionType::Zlib => self.decode_zlib(payload, uncompressed_size)?,
            CompressionType::Zstd => self.decode_zstd(payload, uncompressed_size)?,
            CompressionType::Snappy => self.decode_snappy(payload)?,
        };

        if decoded.len() != uncompressed_size {
            return Err(CompressionError::DecompressionFailed(format!(
                "expected {} uncompressed bytes, got {}",
                uncompressed_size,
                decoded.len()
            )));
        }
        Ok(decoded)
    }

    fn encode_lz4(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        let compressed = lz4_flex::compress(data);
        Ok(Bytes::from(compressed))
    }

    fn decode_lz4(&self, payload: &[u8], uncompressed_size: usize) -> Result<Bytes, CompressionError> {
        let decompressed = lz4_flex::decompress(payload, uncompressed_size)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
        Ok(Bytes::from(decompressed))
    }

    fn encode_zlib(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        use std::io::Write;

        let mut buffer = Vec::with_capacity(data.len());
        let mut encoder = flate2::write::ZlibEncoder::new(&mut buffer, flate2::Compression::fast());
        encoder.write_all(data)?;
        encoder.finish()?;

        Ok(Bytes::from(buffer))
    }

    fn decode_zlib(&self, payload: &[u8], uncompressed_size: usize) -> Result<Bytes, CompressionError> {
        use std::io::Read;

        let mut buffer = Vec::with_capacity(uncompressed_size);
        let mut decoder = flate2::read::ZlibDecoder::new(payload);
        decoder.read_to_end(&mut buffer)?;

        Ok(Bytes::from(buffer))
    }

    fn encode_zstd(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        let compressed = zstd::encode_all(data, 3)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
        Ok(Bytes::from(compressed))
    }

    fn decode_zstd(&self, payload: &[u8], uncompressed_size: usize) -> Result<Bytes, CompressionError> {
        let mut buffer = Vec::with_capacity(uncompressed_size);
        zstd::stream::copy_decode(payload, &mut buffer)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
        Ok(Bytes::from(buffer))
    }

    fn encode_snappy(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder
            .compress_vec(data)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
        Ok(Bytes::from(compressed))
    }

    fn decode_snappy(&self, payload: &[u8]) -> Result<Bytes, CompressionError> {
        let mut decoder = snap::raw::Decoder::new();
        let decompressed = decoder
            .decompress_vec(payload)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
        Ok(Bytes::from(decompressed))
    }
}
