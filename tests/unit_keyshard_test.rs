use crimson::core::keyshard::{
    KeyShard, KeyShardCrc32, KeyShardZero, KeysForShards, NUM_SLOTS, hash_slot, hashed_part,
};

#[test]
fn slot_is_always_in_range() {
    for key in ["", "a", "foo", "{tag}rest", "{}", "{unclosed", "漢字キー"] {
        assert!(usize::from(hash_slot(key.as_bytes())) < NUM_SLOTS);
    }
}

#[test]
fn hashtag_keys_share_a_slot() {
    assert_eq!(
        hash_slot(b"{user42}:profile"),
        hash_slot(b"{user42}:orders")
    );
    // Mutating characters outside the tag changes nothing.
    assert_eq!(hash_slot(b"{user42}:aaaaa"), hash_slot(b"{user42}:zzzzz"));
    // Mutating the tag itself does (for these particular tags).
    assert_ne!(hash_slot(b"{user42}:x"), hash_slot(b"{user43}:x"));
}

#[test]
fn empty_tag_hashes_whole_key() {
    assert_ne!(hash_slot(b"{}aa"), hash_slot(b"{}bb"));
    assert_eq!(hashed_part(b"{}aa"), b"{}aa");
}

#[test]
fn crc32_shard_within_bounds_and_tag_aware() {
    let ks = KeyShardCrc32::new(7);
    for key in ["alpha", "beta", "{t}1", "{t}2"] {
        assert!(ks.shard_by_key(key.as_bytes()) < 7);
    }
    assert_eq!(ks.shard_by_key(b"{t}1"), ks.shard_by_key(b"{t}2"));
    assert_eq!(ks.shards_count(), 7);
}

#[test]
fn zero_shard_maps_everything_to_zero() {
    let ks = KeyShardZero;
    assert_eq!(ks.shard_by_key(b"whatever"), 0);
    assert_eq!(ks.shards_count(), 1);
}

#[test]
fn keys_for_shards_cover_cluster_slots() {
    let keys = KeysForShards::generate(
        4,
        |key| usize::from(hash_slot(key.as_bytes())) * 4 / NUM_SLOTS,
        3,
    )
    .unwrap();
    for shard in 0..4 {
        let key = keys.key_for_shard(shard);
        assert!(!key.is_empty());
        assert!(key.len() <= 3);
        assert!(key.bytes().all(|b| b.is_ascii_lowercase()));
        assert_eq!(usize::from(hash_slot(key.as_bytes())) * 4 / NUM_SLOTS, shard);
    }
}

#[test]
fn keys_for_shards_fails_for_unreachable_shard() {
    // A router that never returns the last shard cannot be covered.
    let result = KeysForShards::generate(3, |_key| 0, 2);
    assert!(result.is_err());
}
