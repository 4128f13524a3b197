// tests/property_test.rs

//! Property-based tests for key routing, the RESP codec and the rebalance
//! quota arithmetic: invariants that must hold for arbitrary inputs.

use bytes::{Bytes, BytesMut};
use crimson::core::keyshard::{KeyShard, KeyShardCrc32, NUM_SLOTS, hash_slot};
use crimson::core::protocol::{RespFrame, RespFrameCodec};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn slot_stays_in_range(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        prop_assert!(usize::from(hash_slot(&key)) < NUM_SLOTS);
    }

    #[test]
    fn crc32_shard_stays_in_range(
        key in proptest::collection::vec(any::<u8>(), 0..64),
        shards in 1usize..32,
    ) {
        let ks = KeyShardCrc32::new(shards);
        prop_assert!(ks.shard_by_key(&key) < shards);
    }

    #[test]
    fn hashtag_isolates_routing(
        tag in "[a-z0-9]{1,12}",
        suffix_a in "[a-z0-9]{0,12}",
        suffix_b in "[a-z0-9]{0,12}",
    ) {
        // Keys with identical hashtags route identically no matter what
        // surrounds the tag.
        let key_a = format!("{{{tag}}}:{suffix_a}");
        let key_b = format!("{{{tag}}}:{suffix_b}");
        prop_assert_eq!(hash_slot(key_a.as_bytes()), hash_slot(key_b.as_bytes()));
        prop_assert_eq!(hash_slot(key_a.as_bytes()), hash_slot(tag.as_bytes()));

        let ks = KeyShardCrc32::new(5);
        prop_assert_eq!(ks.shard_by_key(key_a.as_bytes()), ks.shard_by_key(key_b.as_bytes()));
    }

    #[test]
    fn command_arrays_round_trip(
        args in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..128),
            1..8,
        )
    ) {
        let frame = RespFrame::command(args.iter().map(|a| Bytes::copy_from_slice(a)));
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = RespFrameCodec.decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(frame));
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn decoder_never_panics_on_garbage(input in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut buf = BytesMut::from(&input[..]);
        // Malformed input must produce an error or a wait-for-more, never a
        // panic or an infinite loop.
        let mut codec = RespFrameCodec;
        for _ in 0..input.len() + 1 {
            match codec.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }

    #[test]
    fn split_frames_decode_incrementally(split in 0usize..30) {
        let frame = RespFrame::command([
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"key"),
            Bytes::from_static(b"value"),
        ]);
        let mut encoded = BytesMut::new();
        RespFrameCodec.encode(frame.clone(), &mut encoded).unwrap();
        let encoded = encoded.freeze();
        let split = split.min(encoded.len());

        let mut codec = RespFrameCodec;
        let mut buf = BytesMut::from(&encoded[..split]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[split..]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }
}
