//! Property-based tests for the bus invariants.
//!
//! These pin the contract every backend must honor, exercised against the
//! in-process bus: append order is read order, cursors are strictly
//! monotone, canonical ids make duplicates recognizable, and trimming never
//! reorders what remains.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use agent_mesh_core::bus::{Bus, BusMessage};
use agent_mesh_core::MemoryBus;
use proptest::prelude::*;
use std::cmp::Ordering;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    /// For any serialized sequence of publishes, a read strictly after the
    /// pre-publish anchor returns the same payloads in the same order.
    #[test]
    fn reads_preserve_append_order(payloads in proptest::collection::vec("[a-z0-9]{0,16}", 1..32)) {
        let rt = runtime();
        rt.block_on(async {
            let bus = MemoryBus::new();
            let anchor = bus.latest("chat:p").await.unwrap();
            for payload in &payloads {
                bus.publish("chat:p", &BusMessage::new(payload.clone())).await.unwrap();
            }

            let entries = bus
                .read("chat:p", Some(&anchor), payloads.len() + 1, None)
                .await
                .unwrap();
            let read_back: Vec<&str> =
                entries.iter().map(|e| e.message.payload.as_str()).collect();
            prop_assert_eq!(read_back, payloads.iter().map(String::as_str).collect::<Vec<_>>());
            Ok(())
        })?;
    }

    /// Cursors returned by successive publishes compare strictly greater
    /// under the bus's ordering relation.
    #[test]
    fn cursors_are_strictly_monotone(count in 2usize..64) {
        let rt = runtime();
        rt.block_on(async {
            let bus = MemoryBus::new();
            let mut cursors = Vec::with_capacity(count);
            for index in 0..count {
                cursors.push(
                    bus.publish("chat:m", &BusMessage::new(format!("m{index}")))
                        .await
                        .unwrap(),
                );
            }
            for pair in cursors.windows(2) {
                prop_assert_eq!(bus.compare(&pair[0], &pair[1]), Ordering::Less);
                prop_assert_eq!(bus.compare(&pair[1], &pair[0]), Ordering::Greater);
            }
            prop_assert_eq!(bus.compare(&cursors[0], &cursors[0]), Ordering::Equal);
            Ok(())
        })?;
    }

    /// A redelivered/duplicated message stays recognizable by its canonical
    /// id, and distinct messages never collide.
    #[test]
    fn canonical_ids_expose_duplicates(duplicates in 1usize..5) {
        let rt = runtime();
        rt.block_on(async {
            let bus = MemoryBus::new();
            let anchor = bus.latest("chat:d").await.unwrap();
            let message = BusMessage::new("same".to_string());
            for _ in 0..=duplicates {
                bus.publish("chat:d", &message).await.unwrap();
            }
            bus.publish("chat:d", &BusMessage::new("other".to_string()))
                .await
                .unwrap();

            let entries = bus.read("chat:d", Some(&anchor), 16, None).await.unwrap();
            let same: Vec<_> = entries
                .iter()
                .filter(|e| e.message.id == message.id)
                .collect();
            prop_assert_eq!(same.len(), duplicates + 1);
            prop_assert!(entries.iter().any(|e| e.message.id != message.id));
            Ok(())
        })?;
    }

    /// Trimming drops only the oldest entries; what remains keeps its order
    /// and `earliest` tracks the retention boundary.
    #[test]
    fn trimming_keeps_a_suffix_in_order(
        total in 1usize..48,
        max_len in 1usize..16,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let bus = MemoryBus::new().with_max_len(max_len);
            for index in 0..total {
                bus.publish("chat:t", &BusMessage::new(format!("m{index}")))
                    .await
                    .unwrap();
            }

            let earliest = bus.earliest("chat:t").await.unwrap().unwrap();
            let entries = bus.read("chat:t", Some(&bus.floor()), total + 1, None).await.unwrap();

            let retained = total.min(max_len);
            prop_assert_eq!(entries.len(), retained);
            prop_assert_eq!(&entries[0].cursor, &earliest);
            let expected: Vec<String> =
                (total - retained..total).map(|i| format!("m{i}")).collect();
            let read_back: Vec<String> =
                entries.iter().map(|e| e.message.payload.clone()).collect();
            prop_assert_eq!(read_back, expected);
            Ok(())
        })?;
    }
}
