// src/core/keyshard.rs

//! Key-to-shard routing: the cluster hash slot algorithm and the pluggable
//! key shard functions used for Sentinel-managed deployments.

use crate::core::CrimsonError;
use crc::{CRC_16_XMODEM, CRC_32_ISO_HDLC, Crc};

/// The total number of hash slots in a Redis cluster.
pub const NUM_SLOTS: usize = 16384;

const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Extracts the hashed portion of a key per the cluster convention: the
/// substring between the first `{` and the next `}` if non-empty, otherwise
/// the whole key.
pub fn hashed_part(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        // Empty tags ("{}") hash the whole key.
        if end_offset > 0 {
            return &key[start + 1..start + 1 + end_offset];
        }
    }
    key
}

/// Calculates the cluster hash slot for a key: CRC16 (poly 0x1021) of the
/// hashtag-extracted portion, masked to 14 bits.
pub fn hash_slot(key: &[u8]) -> u16 {
    CRC16_ALGO.checksum(hashed_part(key)) & 0x3fff
}

/// Pluggable key-to-shard mapping for non-cluster deployments.
pub trait KeyShard: Send + Sync {
    fn shard_by_key(&self, key: &[u8]) -> usize;
    fn shards_count(&self) -> usize;
}

/// CRC32 of the hashtag-extracted key, modulo the shard count.
pub struct KeyShardCrc32 {
    shard_count: usize,
}

impl KeyShardCrc32 {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard count must be positive");
        Self { shard_count }
    }
}

impl KeyShard for KeyShardCrc32 {
    fn shard_by_key(&self, key: &[u8]) -> usize {
        CRC32_ALGO.checksum(hashed_part(key)) as usize % self.shard_count
    }

    fn shards_count(&self) -> usize {
        self.shard_count
    }
}

/// Routes every key to shard 0. Used for single-shard deployments and for
/// subscription placement where the shard is chosen by other means.
pub struct KeyShardZero;

impl KeyShard for KeyShardZero {
    fn shard_by_key(&self, _key: &[u8]) -> usize {
        0
    }

    fn shards_count(&self) -> usize {
        1
    }
}

/// Precomputed minimum-length lowercase keys, one per shard.
///
/// Used when a command requires a concrete key argument but the caller only
/// has a shard index. Generation enumerates candidate lengths 1..=max_len
/// lexicographically and records the first key that lands in each shard.
pub struct KeysForShards {
    keys: Vec<String>,
}

impl KeysForShards {
    pub fn generate<F>(
        shard_count: usize,
        shard_by_key: F,
        max_len: usize,
    ) -> Result<Self, CrimsonError>
    where
        F: Fn(&str) -> usize,
    {
        let mut keys = vec![String::new(); shard_count];
        let mut need = shard_count;
        let mut key_buf = Vec::new();
        for len in 1..=max_len {
            key_buf.resize(len, b'a');
            Self::fill_lex_min(0, len, &shard_by_key, &mut need, &mut key_buf, &mut keys);
            if need == 0 {
                break;
            }
        }
        if need != 0 {
            let missing = keys
                .iter()
                .position(String::is_empty)
                .expect("need > 0 implies an empty slot");
            return Err(CrimsonError::KeyGeneration(missing));
        }
        Ok(Self { keys })
    }

    pub fn key_for_shard(&self, shard_idx: usize) -> &str {
        &self.keys[shard_idx]
    }

    fn fill_lex_min<F>(
        pos: usize,
        len: usize,
        shard_by_key: &F,
        need: &mut usize,
        key_buf: &mut Vec<u8>,
        keys: &mut [String],
    ) where
        F: Fn(&str) -> usize,
    {
        if pos == len {
            let key = std::str::from_utf8(key_buf).expect("buffer holds ascii letters");
            let shard = shard_by_key(key);
            if keys[shard].is_empty() {
                keys[shard] = key.to_string();
                *need -= 1;
            }
            return;
        }
        for c in b'a'..=b'z' {
            key_buf[pos] = c;
            Self::fill_lex_min(pos + 1, len, shard_by_key, need, key_buf, keys);
            if *need == 0 {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashtag_isolates_hashed_part() {
        assert_eq!(hashed_part(b"{user42}:profile"), b"user42");
        assert_eq!(hashed_part(b"plain"), b"plain");
        assert_eq!(hashed_part(b"no{}tag"), b"no{}tag");
        assert_eq!(hashed_part(b"open{brace"), b"open{brace");
        // Only the first tag counts.
        assert_eq!(hashed_part(b"{a}{b}"), b"a");
    }

    #[test]
    fn hash_slot_matches_reference_values() {
        // Reference slots from the Redis cluster specification examples.
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"{user1000}.followers"));
        assert!(usize::from(hash_slot(b"anything")) < NUM_SLOTS);
    }

    #[test]
    fn same_hashtag_routes_to_same_shard() {
        let ks = KeyShardCrc32::new(3);
        assert_eq!(
            ks.shard_by_key(b"{user42}:profile"),
            ks.shard_by_key(b"{user42}:orders")
        );
    }

    #[test]
    fn crc32_shard_is_stable_modulo() {
        let ks = KeyShardCrc32::new(3);
        let expected = CRC32_ALGO.checksum(b"plain") as usize % 3;
        assert_eq!(ks.shard_by_key(b"plain"), expected);
    }

    #[test]
    fn generates_distinct_keys_per_shard() {
        let ks = KeyShardCrc32::new(5);
        let keys = KeysForShards::generate(5, |k| ks.shard_by_key(k.as_bytes()), 3).unwrap();
        for shard in 0..5 {
            let key = keys.key_for_shard(shard);
            assert!(!key.is_empty());
            assert_eq!(ks.shard_by_key(key.as_bytes()), shard);
        }
    }
}
