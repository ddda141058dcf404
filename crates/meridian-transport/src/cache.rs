//! # Packet Cache
//!
//! Fixed-capacity ring buffer keyed by 16-bit sequence number, used to
//! answer NACKs and to replay packets for bandwidth probing.
//!
//! ## Key design decisions
//!
//! - `head` always points at the slot holding the newest index. A lookup
//!   computes the slot from the modular distance to the head and only hits
//!   if that slot still holds exactly the requested index.
//! - Indexes newer than the head are never reported as hits.
//! - Items are cloned on insert and on read; callers never share the stored
//!   instance, so the internal lock is only held for the slot copy.
//! - The eviction hook runs after the lock is released.
//!
//! [`RtpPacketCache`] layers one [`PacketCache`] per SSRC on top.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Instant;
use serde::Serialize;

use crate::packet::PacketInfo;
use crate::rtp::RtpView;
use crate::seq;

/// Default per-SSRC capacity: ~1 s of 1 Mbps video at 1200 B packets.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

// ─── Stats ──────────────────────────────────────────────────────────────────

/// Cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub inserts: u64,
    /// Inserts rejected because the index was at least `capacity` older
    /// than the head.
    pub old_inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`; zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    fn merge(&mut self, other: &CacheStats) {
        self.inserts += other.inserts;
        self.old_inserts += other.old_inserts;
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
    }
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    old_inserts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

// ─── PacketCache ────────────────────────────────────────────────────────────

/// A cached item and when it was stored.
#[derive(Debug, Clone)]
pub struct CacheSlot<T> {
    pub index: u16,
    pub item: T,
    pub inserted_at: Instant,
}

struct Ring<T> {
    slots: Vec<Option<CacheSlot<T>>>,
    head: Option<usize>,
}

type EvictionHook<T> = Box<dyn Fn(T) + Send + Sync>;

/// Fixed-capacity, wraparound-aware cache of cloned items.
pub struct PacketCache<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    counters: Counters,
    on_evict: Option<EvictionHook<T>>,
}

impl<T: Clone> PacketCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        PacketCache {
            capacity,
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: None,
            }),
            counters: Counters::default(),
            on_evict: None,
        }
    }

    /// Install a callback receiving items pushed out of the ring.
    pub fn with_eviction_hook(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a clone of `item` under `index`. Returns false if the index is
    /// too old to fit in the ring.
    pub fn insert(&self, item: &T, index: u16, now: Instant) -> bool {
        let n = self.capacity as i64;
        let evicted = {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            let target = match ring.head {
                None => {
                    ring.head = Some(0);
                    0
                }
                Some(head) => {
                    let head_index = match &ring.slots[head] {
                        Some(slot) => slot.index,
                        None => index,
                    };
                    let diff = seq::delta(index, head_index) as i64;
                    if diff <= -n {
                        self.counters.old_inserts.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    if diff < 0 {
                        (head as i64 + diff).rem_euclid(n) as usize
                    } else {
                        let moved = (head as i64 + diff.rem_euclid(n)).rem_euclid(n) as usize;
                        ring.head = Some(moved);
                        moved
                    }
                }
            };
            let previous = ring.slots[target].replace(CacheSlot {
                index,
                item: item.clone(),
                inserted_at: now,
            });
            previous.filter(|slot| slot.index != index)
        };
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &self.on_evict {
                hook(slot.item);
            }
        }
        true
    }

    /// Look up `index`, returning a clone of the stored slot.
    pub fn get(&self, index: u16) -> Option<CacheSlot<T>> {
        let found = {
            let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.head.and_then(|head| {
                let head_slot = ring.slots[head].as_ref()?;
                if seq::is_newer_than(index, head_slot.index) {
                    return None;
                }
                let diff = seq::delta(index, head_slot.index) as i64;
                if diff <= -(self.capacity as i64) {
                    return None;
                }
                let pos = (head as i64 + diff).rem_euclid(self.capacity as i64) as usize;
                ring.slots[pos]
                    .as_ref()
                    .filter(|slot| slot.index == index)
                    .cloned()
            })
        };
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Up to `limit` cached items, newest first. Does not touch hit/miss
    /// counters.
    pub fn newest(&self, limit: usize) -> Vec<CacheSlot<T>> {
        if limit == 0 {
            return Vec::new();
        }
        let mut taken = 0;
        self.newest_until(|_| {
            taken += 1;
            taken >= limit
        })
    }

    /// Cached items newest first, stopping after the first item for which
    /// `stop` returns true.
    pub fn newest_until(&self, mut stop: impl FnMut(&T) -> bool) -> Vec<CacheSlot<T>> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let Some(head) = ring.head else {
            return Vec::new();
        };
        let Some(head_index) = ring.slots[head].as_ref().map(|s| s.index) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for back in 0..self.capacity {
            let pos = (head + self.capacity - back) % self.capacity;
            let expected = head_index.wrapping_sub(back as u16);
            if let Some(slot) = &ring.slots[pos] {
                if slot.index == expected {
                    out.push(slot.clone());
                    if stop(&slot.item) {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Drop every cached item.
    pub fn flush(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.head = None;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            old_inserts: self.counters.old_inserts.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

// ─── Per-SSRC Cache ─────────────────────────────────────────────────────────

/// One [`PacketCache`] of RTP packets per SSRC.
///
/// The SSRC map and each ring have their own locks; the map lock is released
/// before a ring is touched.
pub struct RtpPacketCache {
    capacity: usize,
    streams: Mutex<HashMap<u32, Arc<PacketCache<PacketInfo>>>>,
}

impl RtpPacketCache {
    pub fn new(capacity: usize) -> Self {
        RtpPacketCache {
            capacity,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn stream(&self, ssrc: u32) -> Arc<PacketCache<PacketInfo>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            streams
                .entry(ssrc)
                .or_insert_with(|| Arc::new(PacketCache::new(self.capacity))),
        )
    }

    fn existing(&self, ssrc: u32) -> Option<Arc<PacketCache<PacketInfo>>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ssrc)
            .cloned()
    }

    /// Cache an RTP packet under its SSRC and sequence number. Retransmissions
    /// and probes are not cached.
    pub fn insert(&self, packet: &PacketInfo, now: Instant) -> bool {
        if packet.retransmission || packet.probing {
            return false;
        }
        let Ok(view) = RtpView::parse(&packet.buffer) else {
            return false;
        };
        let (ssrc, seq) = (view.ssrc(), view.sequence_number());
        self.stream(ssrc).insert(packet, seq, now)
    }

    pub fn get(&self, ssrc: u32, seq: u16) -> Option<PacketInfo> {
        self.existing(ssrc)?.get(seq).map(|slot| slot.item)
    }

    /// Up to `limit` packets of `ssrc`, newest first.
    pub fn newest(&self, ssrc: u32, limit: usize) -> Vec<PacketInfo> {
        match self.existing(ssrc) {
            Some(cache) => cache.newest(limit).into_iter().map(|s| s.item).collect(),
            None => Vec::new(),
        }
    }

    /// Newest packets of `ssrc` whose combined size first reaches `budget`
    /// bytes (or all of them, if the cache holds less).
    pub fn newest_covering(&self, ssrc: u32, budget: usize) -> Vec<PacketInfo> {
        let Some(cache) = self.existing(ssrc) else {
            return Vec::new();
        };
        if budget == 0 {
            return Vec::new();
        }
        let mut total = 0;
        cache
            .newest_until(|packet| {
                total += packet.len();
                total >= budget
            })
            .into_iter()
            .map(|s| s.item)
            .collect()
    }

    pub fn remove_stream(&self, ssrc: u32) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ssrc);
    }

    /// Counters summed over every SSRC.
    pub fn stats(&self) -> CacheStats {
        let caches: Vec<_> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut total = CacheStats::default();
        for cache in caches {
            total.merge(&cache.stats());
        }
        total
    }
}
