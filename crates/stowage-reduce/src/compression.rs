//! LZ4 and Zstd compression of chunk payloads

use crate::error::ReduceError;
use serde::{Deserialize, Serialize};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 frame format, fastest
    Lz4,
    /// Zstandard, the repository default
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd { level: 3 }
    }
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
        }
    }
}

/// Check whether compressing data is worthwhile.
/// Returns false if data appears to be already compressed or random (high entropy).
pub fn is_compressible(data: &[u8]) -> bool {
    if data.len() < 64 {
        return true;
    }
    let sample = &data[..data.len().min(4096)];
    let compressed = lz4_flex::compress_prepend_size(sample);
    (compressed.len() as f64) < (sample.len() as f64 * 0.95)
}

/// Compress if worthwhile, returning the algorithm actually applied.
pub fn compress_adaptive(
    data: &[u8],
    preferred: CompressionAlgorithm,
) -> Result<(Vec<u8>, CompressionAlgorithm), ReduceError> {
    if preferred == CompressionAlgorithm::None || !is_compressible(data) {
        return Ok((data.to_vec(), CompressionAlgorithm::None));
    }
    let packed = compress(data, preferred)?;
    if packed.len() >= data.len() {
        return Ok((data.to_vec(), CompressionAlgorithm::None));
    }
    Ok((packed, preferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_algorithm() -> impl Strategy<Value = CompressionAlgorithm> {
        prop_oneof![
            Just(CompressionAlgorithm::None),
            Just(CompressionAlgorithm::Lz4),
            (1i32..=9).prop_map(|level| CompressionAlgorithm::Zstd { level }),
        ]
    }

    proptest! {
        #[test]
        fn prop_envelope_payload_roundtrip(
            algo in any_algorithm(),
            data in prop::collection::vec(0u8..=255, 0..50_000),
        ) {
            let packed = compress(&data, algo).unwrap();
            prop_assert_eq!(decompress(&packed, algo).unwrap(), data);
        }
        #[test]
        fn prop_adaptive_roundtrip(data in prop::collection::vec(0u8..=255, 0..20_000)) {
            let (packed, used) = compress_adaptive(&data, CompressionAlgorithm::default()).unwrap();
            prop_assert!(packed.len() <= data.len() || used == CompressionAlgorithm::None);
            prop_assert_eq!(decompress(&packed, used).unwrap(), data);
        }
    }

    #[test]
    fn default_is_zstd_level_3() {
        assert_eq!(CompressionAlgorithm::default(), CompressionAlgorithm::Zstd { level: 3 });
    }

    #[test]
    fn zeros_compress() {
        let data = vec![0u8; 100_000];
        let (packed, used) = compress_adaptive(&data, CompressionAlgorithm::default()).unwrap();
        assert!(packed.len() < 1000);
        assert_eq!(used, CompressionAlgorithm::Zstd { level: 3 });
    }

    #[test]
    fn random_data_is_stored_raw() {
        use rand::RngCore;
        let mut data = vec![0u8; 10_000];
        rand::thread_rng().fill_bytes(&mut data);
        let (packed, used) = compress_adaptive(&data, CompressionAlgorithm::default()).unwrap();
        assert_eq!(used, CompressionAlgorithm::None);
        assert_eq!(packed, data);
    }
}
