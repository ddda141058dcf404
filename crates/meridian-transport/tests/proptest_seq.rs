//! Property-based tests for sequence-space arithmetic and the structures
//! built on it (packet cache, stream rewriter, RTX framing).

use proptest::prelude::*;
use quanta::Clock;

use meridian_transport::cache::PacketCache;
use meridian_transport::rewriter::ResumableStreamRewriter;
use meridian_transport::rtp::{RtpPacketBuilder, RtpView};
use meridian_transport::rtx::{decode_rtx, encode_rtx};
use meridian_transport::seq::{self, SequenceIndexTracker};

// ─── Ordering ───────────────────────────────────────────────────────────────

proptest! {
    /// Exactly one of a/b is newer for every distinct pair.
    #[test]
    fn newer_is_a_strict_total_relation(a in any::<u16>(), b in any::<u16>()) {
        prop_assume!(a != b);
        prop_assert!(seq::is_newer_than(a, b) ^ seq::is_newer_than(b, a));
        prop_assert_eq!(seq::is_older_than(a, b), seq::is_newer_than(b, a));
    }

    #[test]
    fn equal_is_neither(a in any::<u16>()) {
        prop_assert!(!seq::is_newer_than(a, a));
        prop_assert!(!seq::is_older_than(a, a));
    }

    /// Small forward steps are always newer, across the wrap too.
    #[test]
    fn forward_step_is_newer(a in any::<u16>(), step in 1u16..0x8000) {
        prop_assert!(seq::is_newer_than(a.wrapping_add(step), a));
    }

    #[test]
    fn delta_inverts_apply(a in any::<u16>(), d in -0x7FFFi32..=0x7FFF) {
        let b = seq::apply_delta(a, d);
        prop_assert_eq!(seq::delta(b, a), d);
    }
}

// ─── Index Extension ────────────────────────────────────────────────────────

proptest! {
    /// A monotonically advancing stream extends to strictly increasing
    /// indexes regardless of where it starts.
    #[test]
    fn tracker_is_monotonic(
        start in any::<u16>(),
        steps in prop::collection::vec(1u16..1000, 1..200),
    ) {
        let mut tracker = SequenceIndexTracker::new();
        let mut seq = start;
        let mut last = tracker.update(seq);
        for step in steps {
            seq = seq.wrapping_add(step);
            let index = tracker.update(seq);
            prop_assert_eq!(index - last, step as u64);
            last = index;
        }
    }
}

// ─── Packet Cache ───────────────────────────────────────────────────────────

proptest! {
    /// Whatever the insert order, a hit always returns the item stored for
    /// exactly that index, and nothing newer than the head ever hits.
    #[test]
    fn cache_hits_are_exact(
        start in any::<u16>(),
        offsets in prop::collection::vec(0u16..64, 1..100),
        capacity in 4usize..32,
    ) {
        let (clock, _) = Clock::mock();
        let cache: PacketCache<u16> = PacketCache::new(capacity);
        let mut newest = None;
        for offset in &offsets {
            let index = start.wrapping_add(*offset);
            if cache.insert(&index, index, clock.now()) {
                newest = match newest {
                    Some(n) if !seq::is_newer_than(index, n) => Some(n),
                    _ => Some(index),
                };
            }
        }
        let newest = newest.unwrap();
        for offset in 0..128u16 {
            let index = start.wrapping_add(offset);
            if let Some(slot) = cache.get(index) {
                prop_assert_eq!(slot.index, index);
                prop_assert_eq!(slot.item, index);
                prop_assert!(!seq::is_newer_than(index, newest));
            }
        }
    }
}

// ─── Rewriter ───────────────────────────────────────────────────────────────

proptest! {
    /// For an in-order stream with arbitrary drops, the accepted packets come
    /// out contiguous.
    #[test]
    fn rewriter_output_is_contiguous(
        start in any::<u16>(),
        pattern in prop::collection::vec(any::<bool>(), 1..300),
    ) {
        let mut rewriter = ResumableStreamRewriter::new();
        // The first packet is always accepted to anchor the output.
        let mut expected = rewriter.accept(start).wrapping_add(1);
        for (i, accept) in pattern.iter().enumerate() {
            let seq = start.wrapping_add(i as u16 + 1);
            if *accept {
                let out = rewriter.accept(seq);
                prop_assert_eq!(out, expected);
                expected = expected.wrapping_add(1);
            } else {
                prop_assert_eq!(rewriter.reject(seq), seq);
            }
        }
    }
}

// ─── RTX Framing ────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn rtx_round_trip(
        ssrc in any::<u32>(),
        seq in any::<u16>(),
        pt in 0u8..128,
        payload in prop::collection::vec(any::<u8>(), 0..400),
        rtx_seq in any::<u16>(),
    ) {
        let original = RtpPacketBuilder::new(pt, seq, 1234, ssrc)
            .extension(1, &[0xAA, 0xBB])
            .payload(&payload)
            .build();
        let rtx = encode_rtx(&original, ssrc ^ 1, 97, rtx_seq).unwrap();
        let restored = decode_rtx(&rtx, ssrc, pt).unwrap();

        let view = RtpView::parse(&restored).unwrap();
        prop_assert_eq!(view.ssrc(), ssrc);
        prop_assert_eq!(view.sequence_number(), seq);
        prop_assert_eq!(view.payload_type(), pt);
        prop_assert_eq!(view.payload(), &payload[..]);
        prop_assert_eq!(view.extension(1), Some(&[0xAA, 0xBB][..]));
    }
}
