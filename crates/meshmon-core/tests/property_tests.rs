//! Property tests for the packet pipeline
//!
//! Arbitrary bytes must never panic the framer or dispatcher, and
//! reprocessing must be idempotent whatever the mix of stored packets.

use std::sync::Arc;

use proptest::prelude::*;

use meshmon_core::protocol::StreamFramer;
use meshmon_core::registry::NewChannelKey;
use meshmon_core::reprocess::{MemoryCursorStore, ReprocessJob};
use meshmon_core::testing::{test_key, ManualTimeSource, PacketBuilder};
use meshmon_core::*;

fn arb_stream() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop_oneof![
            3 => any::<u8>(),
            1 => Just(0x94u8),
            1 => Just(0xc3u8),
        ],
        0..2048,
    )
}

/// Which key, if any, each stored packet is encrypted with
fn arb_packet_keys() -> impl Strategy<Value = Vec<Option<u8>>> {
    prop::collection::vec(prop::option::of(0u8..3), 1..24)
}

proptest! {
    #[test]
    fn test_random_streams_never_panic(stream in arb_stream(), chunk in 1usize..64) {
        let config = MeshmonConfig::testing();
        let clock = Arc::new(ManualTimeSource::new(Timestamp::new(1_000)));
        let mut pipeline = PacketPipeline::new(SharedState::new(&config), &config, clock);
        let mut framer = StreamFramer::new();

        for piece in stream.chunks(chunk) {
            framer.push(piece);
            while let Some(frame) = framer.next_frame() {
                if let Ok(frame) = frame {
                    prop_assert!(frame.len() <= protocol::MAX_FRAME_PAYLOAD);
                    let _ = pipeline.process_frame(&frame);
                }
            }
        }
        prop_assert!(framer.buffered() <= stream.len());
    }

    #[test]
    fn test_reprocessing_twice_equals_once(keys in arb_packet_keys(), batch in 1usize..6) {
        let config = MeshmonConfig::testing();
        let clock = Arc::new(ManualTimeSource::new(Timestamp::new(1_000)));
        let state = SharedState::new(&config);
        let mut pipeline = PacketPipeline::new(state.clone(), &config, clock.clone());

        for (i, key) in keys.iter().enumerate() {
            let builder = PacketBuilder::text(0x500, "stored while the key was unknown").id(i as u32 + 1);
            let builder = match key {
                Some(seed) => builder.encrypted("Ops", &test_key(*seed)),
                None => builder.ciphertext(vec![0xa5; 20]),
            };
            pipeline.process_packet(builder.build());
        }

        // Only keys 0 and 1 become known
        for seed in 0..2u8 {
            state
                .registry
                .write()
                .create(NewChannelKey::new("Ops", test_key(seed)).with_name_validation())
                .unwrap();
        }
        let entries = state.registry.read().enabled_in_order();
        let cursors = MemoryCursorStore::new();

        let first = ReprocessJob::new(None, batch, clock.now())
            .run_to_completion(state.packet_log.as_ref(), &entries, &cursors, clock.now())
            .unwrap();
        let tags_after_first: Vec<_> = (1..=keys.len() as u64)
            .map(|id| state.packet_log.get(LogId::new(id)).map(|r| r.tag()))
            .collect();
        let counts_after_first: Vec<u64> = entries.iter().map(|e| e.usage().decrypted_count()).collect();

        let second = ReprocessJob::new(None, batch, clock.now())
            .run_to_completion(state.packet_log.as_ref(), &entries, &cursors, clock.now())
            .unwrap();
        let tags_after_second: Vec<_> = (1..=keys.len() as u64)
            .map(|id| state.packet_log.get(LogId::new(id)).map(|r| r.tag()))
            .collect();
        let counts_after_second: Vec<u64> = entries.iter().map(|e| e.usage().decrypted_count()).collect();

        let expected = keys.iter().filter(|k| matches!(k, Some(0) | Some(1))).count();
        prop_assert_eq!(first.len(), expected);
        prop_assert!(second.is_empty());
        prop_assert_eq!(tags_after_first, tags_after_second);
        prop_assert_eq!(counts_after_first, counts_after_second.clone());
        prop_assert_eq!(counts_after_second.iter().sum::<u64>(), expected as u64);
    }
}
