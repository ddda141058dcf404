//! # Sequence Space
//!
//! Modular 16-bit sequence arithmetic. Every component that orders RTP or
//! transport-wide sequence numbers goes through these helpers; raw integer
//! comparison of sequence numbers is never correct across wraparound.
//!
//! ## Key design decisions
//!
//! - `a` is newer than `b` when `(a - b) mod 65536` lies in `(0, 32768)`.
//!   The single ambiguous distance of exactly 32768 is broken by numeric
//!   value so that for any `a != b` exactly one of the two orders holds.
//! - [`SequenceIndexTracker`] extends 16-bit values into a monotonic `u64`
//!   index space so ordered maps can key on them directly.

/// Half of the 16-bit sequence space.
const HALF: u16 = 0x8000;

/// Returns true if `a` is newer (later) than `b` in modular order.
#[inline]
pub fn is_newer_than(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    if diff == HALF {
        a > b
    } else {
        diff != 0 && diff < HALF
    }
}

/// Returns true if `a` is older (earlier) than `b` in modular order.
#[inline]
pub fn is_older_than(a: u16, b: u16) -> bool {
    is_newer_than(b, a)
}

/// Signed modular distance from `b` to `a`, in `[-32768, 32767]`.
///
/// Positive when `a` is newer than `b`.
#[inline]
pub fn delta(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// `(seq + d) mod 65536`.
#[inline]
pub fn apply_delta(seq: u16, d: i32) -> u16 {
    seq.wrapping_add(d as u16)
}

/// Iterate `start..end` in modular order (exclusive of `end`).
pub fn range(start: u16, end: u16) -> impl Iterator<Item = u16> {
    let count = end.wrapping_sub(start);
    (0..count).map(move |i| start.wrapping_add(i))
}

// ─── Sequence Counter ───────────────────────────────────────────────────────

/// Wrapping 16-bit sequence number generator.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    pub fn new(start: u16) -> Self {
        SequenceCounter { next: start }
    }

    /// Start at a random offset, as RTP senders are expected to.
    pub fn random() -> Self {
        SequenceCounter {
            next: rand::random::<u16>(),
        }
    }

    /// Return the next sequence number and advance.
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    /// Peek the next value without advancing.
    pub fn peek(&self) -> u16 {
        self.next
    }
}

// ─── Index Tracker ──────────────────────────────────────────────────────────

/// Offset applied to the first extended index so that packets older than the
/// first one seen still map to a non-negative index.
const INDEX_BASE: u64 = 1 << 16;

/// Extends 16-bit sequence numbers into a monotonic 64-bit index space.
///
/// Each value is placed at the modular distance from the highest value seen
/// so far, so reordering across a wrap lands on the correct side.
#[derive(Debug, Clone, Default)]
pub struct SequenceIndexTracker {
    highest: Option<(u16, u64)>,
}

impl SequenceIndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend `seq` and update the highest index if it moved forward.
    pub fn update(&mut self, seq: u16) -> u64 {
        let index = self.interpret(seq);
        match self.highest {
            Some((_, highest)) if index <= highest => {}
            _ => self.highest = Some((seq, index)),
        }
        index
    }

    /// Extend `seq` without updating state.
    pub fn interpret(&self, seq: u16) -> u64 {
        match self.highest {
            None => INDEX_BASE + seq as u64,
            Some((highest_seq, highest_index)) => {
                let d = delta(seq, highest_seq) as i64;
                (highest_index as i64 + d).max(0) as u64
            }
        }
    }

    /// Highest extended index seen, if any.
    pub fn highest_index(&self) -> Option<u64> {
        self.highest.map(|(_, index)| index)
    }

    pub fn reset(&mut self) {
        self.highest = None;
    }
}
