use std::fmt;

use ahash::RandomState;

/// Size of a cache key in bytes.
pub const KEY_SIZE: usize = 16;

// Fixed seeds: every process attached to an arena must compute the same hash.
const SHORT_HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];
const DERIVE_SEEDS_LO: [u64; 4] = [
    0x4528_21e6_38d0_1377,
    0xbe54_66cf_34e9_0c6c,
    0xc0ac_29b7_c97c_50dd,
    0x3f84_d5b5_b547_0917,
];
const DERIVE_SEEDS_HI: [u64; 4] = [
    0x9216_d5d9_8979_fb1b,
    0xd131_0ba6_98df_b5ac,
    0x2ffd_72db_d01a_dfb7,
    0xb8e1_afed_6a26_7e96,
];

/// Key recorded in the arena header to detect builds that hash differently.
pub const HASH_PROBE_KEY: CacheKey = CacheKey(*b"buffer-cache-key");

/// Opaque 128-bit cache key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CacheKey([u8; KEY_SIZE]);

impl CacheKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        CacheKey(bytes)
    }

    /// Build a key from a slice of exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        Some(CacheKey(bytes))
    }

    /// Derive a key from arbitrary bytes, e.g. a file path.
    ///
    /// Two independently seeded 64-bit hashes, not a cryptographic digest.
    pub fn derive(data: &[u8]) -> Self {
        let lo = seeded(&DERIVE_SEEDS_LO).hash_one(data);
        let hi = seeded(&DERIVE_SEEDS_HI).hash_one(data);
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        CacheKey(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The 32-bit hash ordering the entry index.
    #[inline]
    pub fn short_hash(&self) -> u32 {
        short_hash(&self.0)
    }
}

impl From<[u8; KEY_SIZE]> for CacheKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        CacheKey(bytes)
    }
}

impl AsRef<[u8]> for CacheKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

fn seeded(seeds: &[u64; 4]) -> RandomState {
    RandomState::with_seeds(seeds[0], seeds[1], seeds[2], seeds[3])
}

/// Short hash over a raw key, folded from 64 to 32 bits.
#[inline]
pub fn short_hash(key: &[u8; KEY_SIZE]) -> u32 {
    let h = seeded(&SHORT_HASH_SEEDS).hash_one(key);
    (h ^ (h >> 32)) as u32
}
