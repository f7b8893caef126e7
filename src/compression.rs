//! Compression for record tables and persisted index blobs
//!
//! Image stacks are never compressed: plane reads need raw, seekable pixel
//! data. Small payloads go through a [`Compressor`] picked by
//! [`CompressionMethod`].

use crate::error::{CubeError, Result};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Codec of a stored payload; the discriminant is its on-disk tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    Deflate = 1,
    Zstd = 3,
}

impl CompressionMethod {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn is_compressed(self) -> bool {
        self != CompressionMethod::None
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = CubeError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Deflate),
            3 => Ok(CompressionMethod::Zstd),
            other => Err(CubeError::Decompression(format!(
                "unknown compression tag {}",
                other
            ))),
        }
    }
}

/// Upper bound on buffer space reserved from an untrusted size hint
const MAX_PREALLOCATION: usize = 1 << 20;

/// A codec for byte payloads
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// `size_hint` is the expected decoded length, used only to preallocate
    /// up to a fixed bound
    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

/// Stores payloads as they are
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Compressor for Passthrough {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _size_hint: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    /// 0 (store) to 9 (smallest)
    pub level: u32,
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2);
        DeflateEncoder::new(data, FlateCompression::new(self.level.min(9)))
            .read_to_end(&mut out)
            .map_err(|e| CubeError::Compression(e.to_string()))?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size_hint.min(MAX_PREALLOCATION));
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CubeError::Decompression(e.to_string()))?;
        Ok(out)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    pub level: i32,
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level).map_err(|e| CubeError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], _size_hint: usize) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| CubeError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Default-level codec for `method`
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(Passthrough),
        CompressionMethod::Deflate => Box::new(DeflateCompressor::default()),
        CompressionMethod::Zstd => Box::new(ZstdCompressor::default()),
    }
}

const FRAME_HEADER_LEN: usize = 4 + 1 + 8;

/// Wrap `payload` as `magic | method tag | raw length (u64 LE) | compressed bytes`
pub fn encode_frame(magic: &[u8; 4], method: CompressionMethod, payload: &[u8]) -> Result<Vec<u8>> {
    let body = get_compressor(method).compress(payload)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(magic);
    frame.push(method.tag());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Inverse of [`encode_frame`]; rejects foreign magic and truncated payloads
pub fn decode_frame(magic: &[u8; 4], frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < FRAME_HEADER_LEN || &frame[..4] != magic {
        return Err(CubeError::Decompression("not a recognised frame".to_string()));
    }
    let method = CompressionMethod::try_from(frame[4])?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&frame[5..FRAME_HEADER_LEN]);
    let expected = usize::try_from(u64::from_le_bytes(len))
        .map_err(|_| CubeError::Decompression("frame length exceeds memory".to_string()))?;

    let payload = get_compressor(method).decompress(&frame[FRAME_HEADER_LEN..], expected)?;
    if payload.len() != expected {
        return Err(CubeError::Decompression(format!(
            "frame decodes to {} bytes, header says {}",
            payload.len(),
            expected
        )));
    }
    Ok(payload)
}
