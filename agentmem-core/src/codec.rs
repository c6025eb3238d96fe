//! Binary codec for stored payloads.
//!
//! Records are serialized with postcard, then framed by a single marker byte:
//! `0x00` for raw payloads, `0x01` for lz4-compressed payloads. Compression
//! is attempted only for payloads at or above the configured threshold and
//! kept only when it actually shrinks the payload, so small values pay one
//! byte of overhead and nothing else.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{Error, Result};

/// Marker byte for an uncompressed payload.
pub const MARKER_RAW: u8 = 0x00;

/// Marker byte for an lz4-compressed payload.
pub const MARKER_LZ4: u8 = 0x01;

/// Framing codec with a compression threshold and a payload size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    /// Payloads at or above this size are compression candidates
    pub compression_threshold: usize,
    /// Encoded or decoded payloads above this size are rejected
    pub max_payload_bytes: usize,
}

impl PayloadCodec {
    /// Create a codec with the given threshold and ceiling.
    #[must_use]
    pub fn new(compression_threshold: usize, max_payload_bytes: usize) -> Self {
        Self {
            compression_threshold,
            max_payload_bytes,
        }
    }

    /// Frame raw bytes, compressing when it pays off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the input exceeds the size ceiling.
    pub fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() > self.max_payload_bytes {
            return Err(Error::Validation(format!(
                "payload of {} bytes exceeds maximum of {}",
                bytes.len(),
                self.max_payload_bytes
            )));
        }

        if bytes.len() >= self.compression_threshold {
            let compressed = lz4_flex::compress_prepend_size(bytes);
            if compressed.len() < bytes.len() {
                trace!(
                    raw = bytes.len(),
                    compressed = compressed.len(),
                    "compressed payload"
                );
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(MARKER_LZ4);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }

        let mut out = Vec::with_capacity(1 + bytes.len());
        out.push(MARKER_RAW);
        out.extend_from_slice(bytes);
        Ok(out)
    }

    /// Unframe bytes produced by [`PayloadCodec::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] for an empty input, an unknown marker,
    /// an undecompressable body, or a decoded payload above the ceiling.
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>> {
        let (marker, body) = framed
            .split_first()
            .ok_or_else(|| Error::Corruption("empty payload".to_string()))?;

        if framed.len() > self.max_payload_bytes.saturating_add(1) {
            return Err(Error::Corruption(format!(
                "framed payload of {} bytes exceeds maximum of {}",
                framed.len(),
                self.max_payload_bytes
            )));
        }

        match *marker {
            MARKER_RAW => Ok(body.to_vec()),
            MARKER_LZ4 => {
                let decompressed = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| Error::Corruption(format!("lz4 decompression failed: {e}")))?;
                if decompressed.len() > self.max_payload_bytes {
                    return Err(Error::Corruption(format!(
                        "decompressed payload of {} bytes exceeds maximum of {}",
                        decompressed.len(),
                        self.max_payload_bytes
                    )));
                }
                Ok(decompressed)
            }
            other => Err(Error::Corruption(format!(
                "unknown payload marker byte 0x{other:02x}"
            ))),
        }
    }

    /// Serialize a record with postcard and frame it.
    pub fn encode_record<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = postcard::to_allocvec(value)?;
        self.encode(&bytes)
    }

    /// Unframe and deserialize a record.
    pub fn decode_record<T: DeserializeOwned>(&self, framed: &[u8]) -> Result<T> {
        let bytes = self.decode(framed)?;
        postcard::from_bytes(&bytes)
            .map_err(|e| Error::Corruption(format!("record deserialization failed: {e}")))
    }
}
