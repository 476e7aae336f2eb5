//! Checksum utilities for DataGrid
//!
//! Replica checksums are fixed-width lowercase hex strings. MD5 values are
//! stored bare (32 characters); SHA-256 values carry a `sha2:` scheme
//! prefix so the algorithm can be recovered from a stored value.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read};

pub const SHA256_PREFIX: &str = "sha2:";

/// Digest algorithm used for replica checksums
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Algorithm implied by a stored checksum, if any
    #[must_use]
    pub fn from_checksum(stored: &str) -> Option<Self> {
        if stored.is_empty() {
            None
        } else if stored.starts_with(SHA256_PREFIX) {
            Some(Self::Sha256)
        } else {
            Some(Self::Md5)
        }
    }

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Md5 => "",
            Self::Sha256 => SHA256_PREFIX,
        }
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha256(Sha256),
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    algorithm: ChecksumAlgorithm,
    hasher: Hasher,
    bytes: u64,
}

impl ChecksumCalculator {
    #[must_use]
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            algorithm,
            hasher: Self::fresh(algorithm),
            bytes: 0,
        }
    }

    fn fresh(algorithm: ChecksumAlgorithm) -> Hasher {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(ctx) => ctx.update(data),
        }
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[must_use]
    pub const fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the formatted checksum
    #[must_use]
    pub fn finalize(self) -> String {
        let digest = match self.hasher {
            Hasher::Md5(ctx) => hex_encode(&ctx.compute().0),
            Hasher::Sha256(ctx) => hex_encode(&ctx.finalize()),
        };
        format!("{}{digest}", self.algorithm.prefix())
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        self.hasher = Self::fresh(self.algorithm);
        self.bytes = 0;
    }
}

/// Checksum a byte slice
#[must_use]
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let mut calc = ChecksumCalculator::new(algorithm);
    calc.update(data);
    calc.finalize()
}

/// Checksum everything a reader yields, `buffer_size` bytes at a time
pub fn checksum_reader<R: Read>(
    mut reader: R,
    algorithm: ChecksumAlgorithm,
    buffer_size: usize,
) -> io::Result<(String, u64)> {
    let mut calc = ChecksumCalculator::new(algorithm);
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        calc.update(&buf[..n]);
    }
    let bytes = calc.bytes_hashed();
    Ok((calc.finalize(), bytes))
}

/// Hex encode bytes (lowercase)
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(
            checksum_bytes(b"hello world", ChecksumAlgorithm::Md5),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(checksum_bytes(b"", ChecksumAlgorithm::Md5).len(), 32);
    }

    #[test]
    fn test_sha256_prefixed() {
        let value = checksum_bytes(b"hello world", ChecksumAlgorithm::Sha256);
        assert_eq!(
            value,
            "sha2:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            ChecksumAlgorithm::from_checksum(&value),
            Some(ChecksumAlgorithm::Sha256)
        );
        assert_eq!(
            ChecksumAlgorithm::from_checksum("5eb63bbbe01eeed093cb22bb8f5acdc3"),
            Some(ChecksumAlgorithm::Md5)
        );
        assert_eq!(ChecksumAlgorithm::from_checksum(""), None);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut calc = ChecksumCalculator::new(ChecksumAlgorithm::Md5);
        for chunk in data.chunks(777) {
            calc.update(chunk);
        }
        assert_eq!(calc.bytes_hashed(), data.len() as u64);
        assert_eq!(calc.finalize(), checksum_bytes(&data, ChecksumAlgorithm::Md5));

        let (streamed, bytes) =
            checksum_reader(&data[..], ChecksumAlgorithm::Md5, 64).unwrap();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(streamed, checksum_bytes(&data, ChecksumAlgorithm::Md5));
    }

    #[test]
    fn test_reset() {
        let mut calc = ChecksumCalculator::new(ChecksumAlgorithm::Sha256);
        calc.update(b"garbage");
        calc.reset();
        calc.update(b"hello world");
        assert_eq!(
            calc.finalize(),
            checksum_bytes(b"hello world", ChecksumAlgorithm::Sha256)
        );
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "00ff1a");
    }
}
