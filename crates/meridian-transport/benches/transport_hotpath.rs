//! Per-packet hot-path benchmarks for meridian-transport.
//!
//! - RTP header parsing
//! - Packet cache insert/get
//! - RTX encode/decode
//! - Transport-cc feedback generation
//!
//! Run with: cargo bench --package meridian-transport

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Clock;
use std::time::Duration;

use meridian_transport::cache::{PacketCache, RtpPacketCache};
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtp::{RtpPacketBuilder, RtpView};
use meridian_transport::rtx::{decode_rtx, encode_rtx};
use meridian_transport::tcc::{TccArrival, TccGenerator, TccGeneratorConfig};

fn sample_packet(seq: u16) -> PacketInfo {
    PacketInfo::new(
        RtpPacketBuilder::new(100, seq, seq as u32 * 3000, 0xCAFE)
            .extension(3, &seq.to_be_bytes())
            .payload(&[0xAB; 1200])
            .build(),
    )
}

// ─── RTP ────────────────────────────────────────────────────────────────────

fn bench_rtp_parse(c: &mut Criterion) {
    let packet = sample_packet(1);
    let mut group = c.benchmark_group("rtp");
    group.throughput(Throughput::Elements(1));
    group.bench_function("parse_with_extension", |b| {
        b.iter(|| {
            let view = RtpView::parse(black_box(&packet.buffer)).unwrap();
            black_box(view.extension(3));
        });
    });
    group.finish();
}

// ─── Cache ──────────────────────────────────────────────────────────────────

fn bench_cache(c: &mut Criterion) {
    let (clock, _) = Clock::mock();
    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ring_insert", |b| {
        let cache: PacketCache<u64> = PacketCache::new(1024);
        let mut seq = 0u16;
        b.iter(|| {
            seq = seq.wrapping_add(1);
            cache.insert(&(seq as u64), seq, clock.now());
        });
    });

    group.bench_function("rtp_insert_1200B", |b| {
        let cache = RtpPacketCache::new(1024);
        let packets: Vec<_> = (0..1024u16).map(sample_packet).collect();
        let mut i = 0;
        b.iter(|| {
            cache.insert(black_box(&packets[i % packets.len()]), clock.now());
            i += 1;
        });
    });

    group.bench_function("rtp_get_hit", |b| {
        let cache = RtpPacketCache::new(1024);
        for seq in 0..1024u16 {
            cache.insert(&sample_packet(seq), clock.now());
        }
        let mut seq = 0u16;
        b.iter(|| {
            seq = (seq + 1) % 1024;
            black_box(cache.get(0xCAFE, seq));
        });
    });

    group.finish();
}

// ─── RTX ────────────────────────────────────────────────────────────────────

fn bench_rtx(c: &mut Criterion) {
    let packet = sample_packet(42);
    let rtx = encode_rtx(&packet.buffer, 0xBEEF, 96, 7).unwrap();
    let mut group = c.benchmark_group("rtx");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(encode_rtx(black_box(&packet.buffer), 0xBEEF, 96, 7).unwrap()));
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decode_rtx(black_box(&rtx), 0xCAFE, 100).unwrap()));
    });
    group.finish();
}

// ─── Transport-cc ───────────────────────────────────────────────────────────

fn bench_tcc_generator(c: &mut Criterion) {
    let (clock, mock) = Clock::mock();
    let mut group = c.benchmark_group("tcc");
    group.throughput(Throughput::Elements(100));
    group.bench_function("100_arrivals_one_report", |b| {
        b.iter(|| {
            let mut generator = TccGenerator::new(
                TccGeneratorConfig {
                    periodic: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
                1,
            );
            for seq in 0..100u16 {
                mock.increment(Duration::from_micros(500));
                generator.packet_received(TccArrival {
                    seq,
                    media_ssrc: 0xCAFE,
                    size: 1200,
                    marker: seq % 10 == 9,
                    at: clock.now(),
                });
            }
            black_box(generator.tick(clock.now()));
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_rtp_parse,
    bench_cache,
    bench_rtx,
    bench_tcc_generator
);
criterion_main!(benches);
