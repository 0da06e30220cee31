//! Property-based tests for shmem-connect
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Ring Properties
// ============================================================================

mod ring_properties {
    use super::*;
    use shmem_core::{Frame, Segment, SegmentLayout};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    #[derive(Debug, Clone)]
    enum Op {
        Push(Vec<u8>),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => prop::collection::vec(any::<u8>(), 0..300).prop_map(Op::Push),
            2 => Just(Op::Pop),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of pushes and pops behaves like a bounded FIFO
        #[test]
        fn ring_matches_fifo_model(ops in prop::collection::vec(op(), 1..200)) {
            let dir = TempDir::new().unwrap();
            let layout = SegmentLayout::new(1024, 256).unwrap();
            let mut creator = Segment::create("prop", layout, dir.path()).unwrap();
            let mut opener = Segment::open("prop", dir.path()).unwrap();
            let (mut producer, _) = creator.take_rings().unwrap();
            let (_, mut consumer) = opener.take_rings().unwrap();

            let mut model: VecDeque<Vec<u8>> = VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(payload) => {
                        if payload.len() > 256 {
                            prop_assert!(producer.push(&Frame::data(payload, false)).is_err());
                        } else if producer.push(&Frame::data(payload.clone(), false)).unwrap() {
                            model.push_back(payload);
                        } else {
                            // Refused only when the record cannot fit.
                            prop_assert!(!producer.fits(payload.len()));
                        }
                    }
                    Op::Pop => {
                        let popped = consumer.pop().unwrap().map(Frame::into_payload);
                        prop_assert_eq!(popped, model.pop_front());
                    }
                }
                prop_assert_eq!(consumer.pending_frames(), model.len() as u64);
            }

            while let Some(expected) = model.pop_front() {
                let frame = consumer.pop().unwrap().unwrap();
                prop_assert_eq!(frame.payload(), &expected[..]);
            }
            prop_assert!(consumer.is_empty());
            prop_assert_eq!(producer.free_space(), producer.capacity());
        }
    }
}

// ============================================================================
// Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use shmem_core::Codec;

    proptest! {
        /// Decoding an encoded payload restores it, compressed or not
        #[test]
        fn codec_restores_payload(
            payload in prop::collection::vec(0u8..4, 0..=4096),
            threshold in 0usize..512,
        ) {
            let codec = Codec::new(true, threshold, 4096);
            let encoded = codec.encode(&payload);
            prop_assert!(encoded.len() <= payload.len() || !encoded.compressed);
            if payload.len() < threshold {
                prop_assert!(!encoded.compressed);
            }

            let decoded = codec.decode(encoded.compressed, encoded.bytes.into_owned()).unwrap();
            prop_assert_eq!(decoded, payload);
        }

        /// Arbitrary bytes marked compressed never decode past the frame limit
        #[test]
        fn codec_rejects_or_bounds_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let codec = Codec::new(true, 0, 1024);
            if let Ok(decoded) = codec.decode(true, bytes) {
                prop_assert!(decoded.len() <= 1024);
            }
        }

        /// A disabled codec never compresses
        #[test]
        fn passthrough_never_compresses(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let codec = Codec::passthrough(2048);
            let encoded = codec.encode(&payload);
            prop_assert!(!encoded.compressed);
            prop_assert_eq!(&encoded.bytes[..], &payload[..]);
        }
    }
}

// ============================================================================
// Connection Properties
// ============================================================================

mod connection_properties {
    use super::*;
    use shmem_integration_tests::{pair, small_options};
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Every payload up to the frame limit arrives intact, compressed or not
        #[test]
        fn messages_round_trip(
            payloads in prop::collection::vec(
                prop_oneof![
                    prop::collection::vec(any::<u8>(), 0..=1024),
                    (0usize..=1024).prop_map(|len| vec![0x42; len]),
                ],
                1..24,
            ),
            compression in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let dir = TempDir::new().unwrap();
            let options = small_options(dir.path()).with_compression(compression, 32);

            let received = runtime.block_on(async {
                let (server, client) = pair("prop", options.clone(), options).await.unwrap();
                let sender = async {
                    for payload in &payloads {
                        client.send(payload).await.unwrap();
                    }
                };
                let receiver = async {
                    let mut received = Vec::with_capacity(payloads.len());
                    for _ in 0..payloads.len() {
                        received.push(server.receive().await.unwrap());
                    }
                    received
                };
                let ((), received) = tokio::join!(sender, receiver);
                client.close().await.unwrap();
                server.close().await.unwrap();
                received
            });

            prop_assert_eq!(received, payloads);
        }
    }
}

// ============================================================================
// Frame Header Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use shmem_core::FrameHeader;

    proptest! {
        /// Header decoding never panics and respects the length bound
        #[test]
        fn header_decode_is_total(raw in any::<[u8; 8]>(), max in 0usize..(1 << 20)) {
            if let Ok(header) = FrameHeader::decode(&raw, max) {
                prop_assert!(header.length as usize <= max);
                prop_assert_eq!(header.encode(), raw);
            }
        }
    }
}

// ============================================================================
// Handshake Properties
// ============================================================================

mod handshake_properties {
    use super::*;
    use shmem_core::Hello;

    fn hello() -> impl Strategy<Value = Hello> {
        (
            any::<bool>(),
            0u32..100_000,
            1u32..1000,
            1u32..60_000,
        )
            .prop_map(|(compression, threshold, heartbeat_ms, liveness_ms)| Hello {
                version: shmem_core::PROTOCOL_VERSION,
                capacity: 4096,
                max_frame_size: 1024,
                compression,
                compression_threshold: threshold,
                heartbeat_ms,
                liveness_ms,
            })
    }

    proptest! {
        /// Both sides arrive at the same parameters
        #[test]
        fn negotiation_is_symmetric(a in hello(), b in hello()) {
            prop_assert_eq!(a.negotiate(&b), b.negotiate(&a));
        }

        /// Negotiated timing is at least as patient as either side
        #[test]
        fn negotiation_takes_the_patient_side(a in hello(), b in hello()) {
            let agreed = a.negotiate(&b);
            prop_assert!(agreed.liveness_ms >= a.liveness_ms.max(b.liveness_ms));
            prop_assert!(agreed.compression_threshold >= a.compression_threshold);
            prop_assert_eq!(agreed.compression, a.compression && b.compression);
        }

        /// Hello records survive the wire
        #[test]
        fn hello_decodes_what_it_encodes(a in hello()) {
            prop_assert_eq!(Hello::decode(&a.encode()).unwrap(), a);
        }

        /// Truncated Hello records are rejected, not misread
        #[test]
        fn truncated_hello_is_rejected(a in hello(), cut in 0usize..shmem_core::handshake::HELLO_LEN) {
            let encoded = a.encode();
            prop_assert!(Hello::decode(&encoded[..cut]).is_err());
        }
    }
}
