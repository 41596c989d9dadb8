use conduit_comm::HandoffBuffer;
use conduit_comm::buffer::{blocking_buffer, ring_buffer};
use proptest::prelude::*;

/// Pushes `messages` through a producer/consumer pair one slot at a time and
/// asserts they come back out in the same order, regardless of which
/// variant backs the buffer.
fn round_trip_preserves_order(mut producer: impl HandoffBuffer, mut consumer: impl HandoffBuffer, messages: &[u8]) {
    for &byte in messages {
        let seq = producer.acquire(1).unwrap();
        unsafe { producer.payload(seq).extend_from_slice(&[byte]) };
        producer.release(seq);
    }
    for &expected in messages {
        let seq = consumer.acquire(1).unwrap();
        let got = unsafe { consumer.payload(seq).as_slice()[0] };
        assert_eq!(got, expected);
        consumer.release(seq);
    }
}

proptest! {
    #[test]
    fn ring_buffer_preserves_fifo_order(messages in proptest::collection::vec(any::<u8>(), 0..200)) {
        let (producer, consumer) = ring_buffer(16, 8);
        round_trip_preserves_order(producer, consumer, &messages);
    }

    #[test]
    fn blocking_buffer_preserves_fifo_order(messages in proptest::collection::vec(any::<u8>(), 0..200)) {
        let (producer, consumer) = blocking_buffer(16, 8);
        round_trip_preserves_order(producer, consumer, &messages);
    }

    #[test]
    fn remaining_never_exceeds_capacity(claims in proptest::collection::vec(1u64..=4, 0..50)) {
        let (mut producer, mut consumer) = ring_buffer(4, 8);
        for n in claims {
            if let Ok(seq) = producer.acquire(n.min(4)) {
                producer.release(seq);
                prop_assert!(producer.remaining() <= 4);
                let cseq = consumer.acquire(1).unwrap();
                consumer.release(cseq);
            }
        }
    }
}
