//! LZ4 payload compression.
//!
//! Payloads at or above the threshold are compressed with the LZ4 block
//! format. A compressed payload carries its decompressed size up front,
//! `[decompressed_size:u32 LE][lz4 block]`, so the receiver allocates once.
//! Compression is only kept when it actually makes the frame smaller.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Size of the decompressed-length prefix on compressed payloads
pub const SIZE_PREFIX_LEN: usize = 4;

/// Encoded payload ready for framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded<'a> {
    /// Whether `bytes` is LZ4 compressed
    pub compressed: bool,
    /// Frame payload
    pub bytes: Cow<'a, [u8]>,
}

impl Encoded<'_> {
    /// Encoded length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Compression codec with negotiated parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    enabled: bool,
    threshold: usize,
    max_frame_size: usize,
}

impl Codec {
    /// New codec. A zero threshold is treated as one byte.
    #[must_use]
    pub fn new(enabled: bool, threshold: usize, max_frame_size: usize) -> Self {
        Self {
            enabled,
            threshold: threshold.max(1),
            max_frame_size,
        }
    }

    /// Codec that never compresses
    #[must_use]
    pub fn passthrough(max_frame_size: usize) -> Self {
        Self::new(false, usize::MAX, max_frame_size)
    }

    /// Whether compression is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compression threshold in bytes
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Maximum decompressed payload size
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a payload, compressing it when that pays off.
    #[must_use]
    pub fn encode<'a>(&self, payload: &'a [u8]) -> Encoded<'a> {
        if self.enabled && payload.len() >= self.threshold && payload.len() <= u32::MAX as usize {
            let compressed = lz4_flex::block::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                return Encoded {
                    compressed: true,
                    bytes: Cow::Owned(compressed),
                };
            }
            tracing::trace!(
                "Compression did not shrink {} byte payload, sending raw",
                payload.len()
            );
        }

        Encoded {
            compressed: false,
            bytes: Cow::Borrowed(payload),
        }
    }

    /// Decode a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptFrame`] if the declared size exceeds the
    /// maximum frame size, or decompression fails or yields a different size.
    pub fn decode(&self, compressed: bool, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if !compressed {
            if bytes.len() > self.max_frame_size {
                return Err(Error::corrupt(format!(
                    "raw payload of {} bytes exceeds max frame size {}",
                    bytes.len(),
                    self.max_frame_size
                )));
            }
            return Ok(bytes);
        }

        if bytes.len() < SIZE_PREFIX_LEN {
            return Err(Error::corrupt("compressed payload shorter than size prefix"));
        }
        let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if declared > self.max_frame_size {
            return Err(Error::corrupt(format!(
                "declared size {declared} exceeds max frame size {}",
                self.max_frame_size
            )));
        }

        let mut out = vec![0u8; declared];
        let written = lz4_flex::block::decompress_into(&bytes[SIZE_PREFIX_LEN..], &mut out)
            .map_err(|e| Error::corrupt(format!("lz4 decompression failed: {e}")))?;
        if written != declared {
            return Err(Error::corrupt(format!(
                "decompressed {written} bytes, expected {declared}"
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 16) as u8).collect()
    }

    #[test]
    fn test_below_threshold_passes_through() {
        let codec = Codec::new(true, 1000, 1 << 20);
        let payload = compressible(999);
        let encoded = codec.encode(&payload);
        assert!(!encoded.compressed);
        assert_eq!(&*encoded.bytes, payload.as_slice());
    }

    #[test]
    fn test_large_compressible_payload_is_compressed() {
        let codec = Codec::new(true, 1000, 1 << 20);
        let payload = compressible(10_000);
        let encoded = codec.encode(&payload);
        assert!(encoded.compressed);
        assert!(encoded.len() < payload.len());

        let decoded = codec
            .decode(encoded.compressed, encoded.bytes.into_owned())
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_disabled_codec_never_compresses() {
        let codec = Codec::new(false, 1, 1 << 20);
        assert!(!codec.encode(&compressible(10_000)).compressed);
    }

    #[test]
    fn test_incompressible_payload_sent_raw() {
        use rand::RngCore;
        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);
        let codec = Codec::new(true, 1, 1 << 20);
        assert!(!codec.encode(&payload).compressed);
    }

    #[test]
    fn test_declared_size_over_max_is_corrupt() {
        let big = Codec::new(true, 1, 1 << 20);
        let encoded = big.encode(&compressible(8192)).bytes.into_owned();

        let small = Codec::new(true, 1, 4096);
        let err = small.decode(true, encoded).unwrap_err();
        assert!(matches!(err, Error::CorruptFrame(_)));
    }

    #[test]
    fn test_truncated_block_is_corrupt() {
        let codec = Codec::new(true, 1, 1 << 20);
        let mut encoded = codec.encode(&compressible(8192)).bytes.into_owned();
        encoded.truncate(encoded.len() / 2);
        assert!(codec.decode(true, encoded).is_err());
    }

    #[test]
    fn test_size_prefix_disagreement_is_corrupt() {
        let codec = Codec::new(true, 1, 1 << 20);
        let mut encoded = codec.encode(&compressible(8192)).bytes.into_owned();
        encoded[0..4].copy_from_slice(&9000u32.to_le_bytes());
        assert!(codec.decode(true, encoded).is_err());
    }

    #[test]
    fn test_short_compressed_payload_is_corrupt() {
        let codec = Codec::new(true, 1, 1 << 20);
        assert!(codec.decode(true, vec![1, 2]).is_err());
    }

    #[test]
    fn test_passthrough() {
        let codec = Codec::passthrough(16);
        assert!(!codec.is_enabled());
        assert!(codec.decode(false, vec![0; 17]).is_err());
        assert_eq!(codec.decode(false, vec![7; 16]).unwrap(), vec![7; 16]);
    }
}
