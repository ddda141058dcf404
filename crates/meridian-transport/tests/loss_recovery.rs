//! Loss recovery across components: a sender caching packets, a lossy hop,
//! a receiver requesting what it misses and the sender answering from its
//! cache over RTX.

use std::time::Duration;

use bytes::BytesMut;
use quanta::Clock;

use meridian_transport::cache::RtpPacketCache;
use meridian_transport::events::TransportEvent;
use meridian_transport::keyframe::{KeyframeConfig, KeyframeRequester};
use meridian_transport::nack::{NackConfig, RetransmissionRequester};
use meridian_transport::packet::PacketInfo;
use meridian_transport::rtcp::{self, RtcpPacket};
use meridian_transport::rtp::{RtpPacketBuilder, RtpView};
use meridian_transport::rtx::{RtxDecoder, RtxEncoder, RtxOutcome};
use meridian_transport::streams::{Encoding, PayloadType, RtcpFeedback, SsrcAssociationKind};

const MEDIA_SSRC: u32 = 0x1111;
const RTX_SSRC: u32 = 0x2222;
const RECEIVER_SSRC: u32 = 0x9999;

fn session_events() -> Vec<TransportEvent> {
    vec![
        TransportEvent::PayloadTypeAdded(PayloadType {
            pt: 100,
            encoding: Encoding::Vp8,
            clock_rate: 90_000,
            feedback: RtcpFeedback {
                nack: true,
                pli: true,
                ..Default::default()
            },
        }),
        TransportEvent::PayloadTypeAdded(PayloadType {
            pt: 96,
            encoding: Encoding::Rtx { apt: 100 },
            clock_rate: 90_000,
            feedback: RtcpFeedback::default(),
        }),
        TransportEvent::SsrcAssociation {
            primary: MEDIA_SSRC,
            secondary: RTX_SSRC,
            kind: SsrcAssociationKind::Rtx,
        },
    ]
}

fn media_packet(seq: u16) -> PacketInfo {
    let payload: Vec<u8> = (0..200).map(|i| (i as u16 ^ seq) as u8).collect();
    PacketInfo::new(
        RtpPacketBuilder::new(100, seq, seq as u32 * 3000, MEDIA_SSRC)
            .payload(&payload)
            .build(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[test]
fn nack_rtx_round_trip_recovers_lost_packets() {
    init_tracing();
    let (clock, mock) = Clock::mock();
    let cache = RtpPacketCache::new(256);
    let mut encoder = RtxEncoder::new();
    let mut decoder = RtxDecoder::new();
    let mut requester = RetransmissionRequester::new(NackConfig::default(), RECEIVER_SSRC);
    for event in session_events() {
        encoder.handle_event(&event);
        decoder.handle_event(&event);
    }

    let lost = [5u16, 6, 30];
    let mut delivered = Vec::new();
    for seq in 0..50u16 {
        let packet = media_packet(seq);
        assert!(cache.insert(&packet, clock.now()));
        if !lost.contains(&seq) {
            requester.packet_received(MEDIA_SSRC, seq, clock.now());
            delivered.push(seq);
        }
        mock.increment(Duration::from_millis(5));
    }

    mock.increment(Duration::from_millis(20));
    let nacks = requester.poll(clock.now());
    assert_eq!(nacks.len(), 1);

    // Over the wire and back.
    let mut wire = BytesMut::new();
    for nack in &nacks {
        RtcpPacket::Nack(nack.clone()).encode(&mut wire);
    }
    let parsed = rtcp::parse_compound(&wire).unwrap();
    let RtcpPacket::Nack(nack) = &parsed[0] else {
        panic!("expected NACK, got {:?}", parsed[0]);
    };
    assert_eq!(nack.media_ssrc, MEDIA_SSRC);
    assert_eq!(nack.lost, lost.to_vec());

    for seq in &nack.lost {
        let original = cache.get(nack.media_ssrc, *seq).expect("cached");
        let rtx = encoder.encode(&original).unwrap();
        assert!(rtx.retransmission);
        assert!(!cache.insert(&rtx, clock.now()), "retransmissions are not cached");

        let mut buf = rtx.into_buffer();
        assert_eq!(RtpView::parse(&buf).unwrap().ssrc(), RTX_SSRC);
        assert_eq!(decoder.decode(&mut buf), RtxOutcome::Restored);
        assert_eq!(buf, original.buffer, "restored packet is byte-identical");

        let view = RtpView::parse(&buf).unwrap();
        requester.packet_received(view.ssrc(), view.sequence_number(), clock.now());
        delivered.push(view.sequence_number());
    }

    delivered.sort_unstable();
    assert_eq!(delivered, (0..50).collect::<Vec<_>>());
    assert_eq!(requester.missing_count(MEDIA_SSRC), 0);
    assert_eq!(requester.stats().packets_recovered, 3);
    assert_eq!(decoder.stats().restored, 3);
    assert_eq!(cache.stats().hits, 3);

    let exported = serde_json::to_value(requester.stats()).unwrap();
    assert_eq!(exported["packets_recovered"], 3);
}

#[test]
fn evicted_packets_cannot_be_resent() {
    let (clock, _) = Clock::mock();
    let cache = RtpPacketCache::new(16);
    for seq in 0..100u16 {
        cache.insert(&media_packet(seq), clock.now());
    }
    assert!(cache.get(MEDIA_SSRC, 10).is_none());
    assert!(cache.get(MEDIA_SSRC, 99).is_some());
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn keyframe_requests_are_paced_per_stream() {
    let (clock, mock) = Clock::mock();
    let mut requester = KeyframeRequester::new(KeyframeConfig::default(), RECEIVER_SSRC);
    for event in session_events() {
        requester.handle_event(&event);
    }
    let mut sent = 0;
    for _ in 0..10 {
        if requester.request_keyframe(MEDIA_SSRC, clock.now()).is_some() {
            sent += 1;
        }
        mock.increment(Duration::from_millis(30));
    }
    // t = 0, 120, 240 ms.
    assert_eq!(sent, 3);
    let stats = requester.stats();
    assert_eq!(stats.pli_sent, 3);
    assert_eq!(stats.dropped, 7);
}
