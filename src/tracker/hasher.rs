//! Mixing hashes that collapse an ordered version array into one fingerprint.
//!
//! Every strategy treats the input as a flat sequence of little-endian 64-bit
//! integers. The strategy is fixed per deployment: switching it changes every
//! fingerprint, which only costs clients one extra full response.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};

pub trait VersionHasher: Send + Sync {
    fn hash(&self, versions: &[i64]) -> u64;

    fn name(&self) -> &'static str;
}

/// FNV-1a 64 folded byte by byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fnv1aHasher;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl VersionHasher for Fnv1aHasher {
    fn hash(&self, versions: &[i64]) -> u64 {
        versions
            .iter()
            .flat_map(|version| version.to_le_bytes())
            .fold(FNV_OFFSET_BASIS, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
            })
    }

    fn name(&self) -> &'static str {
        "fnv1a"
    }
}

/// Murmur3 x64 block mix per element followed by the fmix64 finalizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur3FinalizerHasher;

const MURMUR_C1: u64 = 0x87c3_7b91_1142_53d5;
const MURMUR_C2: u64 = 0x4cf5_ad43_2745_937f;

impl VersionHasher for Murmur3FinalizerHasher {
    fn hash(&self, versions: &[i64]) -> u64 {
        let mut h1 = 0u64;

        for &version in versions {
            let mut k1 = version as u64;
            k1 = k1.wrapping_mul(MURMUR_C1);
            k1 = k1.rotate_left(31);
            k1 = k1.wrapping_mul(MURMUR_C2);
            h1 ^= k1;

            h1 = h1.rotate_left(27);
            h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);
        }

        h1 ^= versions.len() as u64;
        fmix64(h1)
    }

    fn name(&self) -> &'static str {
        "murmur3"
    }
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Streaming SHA-256; the first eight digest bytes are read little-endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl VersionHasher for Sha256Hasher {
    fn hash(&self, versions: &[i64]) -> u64 {
        let mut digest = Sha256::new();
        for version in versions {
            digest.update(version.to_le_bytes());
        }
        let output = digest.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&output.as_slice()[..8]);
        u64::from_le_bytes(head)
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

/// Hashing strategy selected in settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HasherKind {
    #[default]
    Fnv1a,
    Murmur3,
    Sha256,
}

impl HasherKind {
    pub fn build(self) -> Arc<dyn VersionHasher> {
        match self {
            HasherKind::Fnv1a => Arc::new(Fnv1aHasher),
            HasherKind::Murmur3 => Arc::new(Murmur3FinalizerHasher),
            HasherKind::Sha256 => Arc::new(Sha256Hasher),
        }
    }
}

impl FromStr for HasherKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fnv1a" | "fnv" => Ok(HasherKind::Fnv1a),
            "murmur3" | "murmur" => Ok(HasherKind::Murmur3),
            "sha256" => Ok(HasherKind::Sha256),
            other => Err(format!(
                "unknown hasher `{other}` (expected fnv1a, murmur3 or sha256)"
            )),
        }
    }
}

impl fmt::Display for HasherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HasherKind::Fnv1a => "fnv1a",
            HasherKind::Murmur3 => "murmur3",
            HasherKind::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}
