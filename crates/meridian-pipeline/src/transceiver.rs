//! # Transceiver
//!
//! Assembles one media transport: a send and a receive pipeline, each on its
//! own worker, the scheduled tasks around them, and the control surface used
//! by the application (events, keyframe requests, probing, estimates).
//!
//! ```text
//! receive: ingress ─► demux ─┬─ rtp ─► decrypt ─► tcc-generator ─► remb ─► rtx-decode
//!                            │           ─► padding-termination ─► nack ─► media
//!                            └─ rtcp ─► decrypt ─► rtcp-termination ─► media
//!
//! send:    ingress ─► demux ─┬─ rtp ─► tcc-tagger ─► abs-send-time ─► packet-cache
//!                            │           ─► encrypt ─► wire
//!                            └─ rtcp ─► encrypt ─► wire
//! ```
//!
//! ## Key design decisions
//!
//! - Locally generated RTCP (NACK, transport-cc feedback, REMB) and NACK
//!   retransmissions are re-injected into the send queue, so they get the
//!   same encryption and ordering as media.
//! - Control events are applied to the components the transceiver owns
//!   directly, queued to both pipelines (ordered with packets), and published
//!   on the [`EventBus`].
//! - Shutdown order: scheduler first (no more injected RTCP), then the
//!   receive pipeline (no more NACK responses), then the send pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use quanta::Clock;
use serde::Serialize;
use tracing::{debug, info};

use meridian_transport::bwe::{Bandwidth, DelayBasedEstimator, EstimatorStats};
use meridian_transport::cache::{CacheStats, RtpPacketCache};
use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::keyframe::{KeyframeRequester, KeyframeStats};
use meridian_transport::nack::{NackStats, RetransmissionRequester};
use meridian_transport::packet::PacketInfo;
use meridian_transport::probing::{ProbingDataSender, ProbingStats};
use meridian_transport::remb::{RembEstimator, RembStats};
use meridian_transport::rtcp::RtcpPacket;
use meridian_transport::rtx::{RtxEncoder, RtxSendStats};
use meridian_transport::tcc::{TccGenerator, TccReceiveStats, TccSendStats, TransportCcEngine};

use crate::config::{Features, TransportConfig};
use crate::error::{PacketSendError, PipelineError};
use crate::events::EventBus;
use crate::graph::{PipelineBuilder, PipelineGraph, StageSnapshot};
use crate::runner::{PipelineHandle, PipelineRunner, RunnerStats};
use crate::scheduler::{SchedulerStats, TaskId, TaskScheduler};
use crate::stage::{Demultiplexer, FnSink, IngressStats, Stage};
use crate::stages::cache::CacheStage;
use crate::stages::crypto::{CryptoProvider, CryptoStage, PacketKind};
use crate::stages::nack::NackObserver;
use crate::stages::padding::PaddingTerminationFilter;
use crate::stages::remb::{AbsSendTimeStage, RembStage};
use crate::stages::rtcp::{NackResponder, RtcpTerminationStage};
use crate::stages::rtx::RtxDecodeStage;
use crate::stages::tcc::{TccGeneratorStage, TccTaggerStage};
use crate::stages::{is_rtcp, is_rtp, EventOutput, PacketOutput, RtcpOutput};

/// How often the REMB estimator is asked for a report.
const REMB_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn terminal(name: &str, output: PacketOutput) -> Stage {
    Stage::sink(FnSink::new(name, move |p| output(p)))
}

// ─── Graph Assembly ─────────────────────────────────────────────────────────

/// Receive-side collaborators.
pub struct ReceiveParts {
    pub generator: Arc<Mutex<TccGenerator>>,
    pub remb: Arc<Mutex<RembEstimator>>,
    pub requester: Arc<Mutex<RetransmissionRequester>>,
    pub engine: Arc<TransportCcEngine>,
    pub responder: NackResponder,
    pub rtcp_out: RtcpOutput,
    pub events: EventOutput,
    pub media: PacketOutput,
}

pub fn build_receive_graph(
    features: &Features,
    parts: ReceiveParts,
    crypto: &dyn CryptoProvider,
    clock: Clock,
) -> Result<PipelineGraph, PipelineError> {
    let mut b = PipelineBuilder::new("receive").with_timeline(features.packet_timeline);
    let rtp = b.chain([
        Stage::transformer(CryptoStage::new(
            "decrypt-rtp",
            PacketKind::Rtp,
            crypto.decryptor(PacketKind::Rtp),
        )),
        Stage::observer(TccGeneratorStage::new(
            parts.generator,
            features.transport_cc,
            parts.rtcp_out,
        )),
        Stage::observer(RembStage::new(parts.remb)),
        Stage::transformer(RtxDecodeStage::new()),
        Stage::filter(PaddingTerminationFilter::new(features.padding_termination)),
        Stage::observer(NackObserver::new(parts.requester, features.nack)),
        terminal("media-rtp", Arc::clone(&parts.media)),
    ]);
    let rtcp = b.chain([
        Stage::transformer(CryptoStage::new(
            "decrypt-rtcp",
            PacketKind::Rtcp,
            crypto.decryptor(PacketKind::Rtcp),
        )),
        Stage::transformer(RtcpTerminationStage::new(
            Some(parts.engine),
            Some(parts.responder),
            parts.events,
        )),
        terminal("media-rtcp", parts.media),
    ]);
    let demux = b.add(Stage::Demux(
        Demultiplexer::exclusive("rtp-rtcp")
            .path("rtcp", is_rtcp, rtcp.first)
            .path("rtp", is_rtp, rtp.first),
    ));
    let ingress = b.add(Stage::observer(IngressStats::new("ingress")));
    b.connect(ingress, demux);
    b.build(ingress, clock)
}

/// Send-side collaborators.
pub struct SendParts {
    pub engine: Arc<TransportCcEngine>,
    pub cache: Arc<RtpPacketCache>,
    pub wire: PacketOutput,
}

pub fn build_send_graph(
    features: &Features,
    parts: SendParts,
    crypto: &dyn CryptoProvider,
    clock: Clock,
) -> Result<PipelineGraph, PipelineError> {
    let mut b = PipelineBuilder::new("send").with_timeline(features.packet_timeline);
    let rtp = b.chain([
        Stage::modifier(TccTaggerStage::new(parts.engine, features.transport_cc)),
        Stage::modifier(AbsSendTimeStage::new(clock.now())),
        Stage::observer(CacheStage::new(parts.cache)),
        Stage::transformer(CryptoStage::new(
            "encrypt-rtp",
            PacketKind::Rtp,
            crypto.encryptor(PacketKind::Rtp),
        )),
        terminal("wire-rtp", Arc::clone(&parts.wire)),
    ]);
    let rtcp = b.chain([
        Stage::transformer(CryptoStage::new(
            "encrypt-rtcp",
            PacketKind::Rtcp,
            crypto.encryptor(PacketKind::Rtcp),
        )),
        terminal("wire-rtcp", parts.wire),
    ]);
    let demux = b.add(Stage::Demux(
        Demultiplexer::exclusive("rtp-rtcp")
            .path("rtcp", is_rtcp, rtcp.first)
            .path("rtp", is_rtp, rtp.first),
    ));
    let ingress = b.add(Stage::observer(IngressStats::new("ingress")));
    b.connect(ingress, demux);
    b.build(ingress, clock)
}

/// Sends locally generated RTCP through `send`.
pub fn rtcp_into(send: PipelineHandle) -> RtcpOutput {
    Arc::new(move |packet: RtcpPacket| {
        if let Err(e) = send.try_send(PacketInfo::new(packet.to_bytes())) {
            debug!(error = %e, "locally generated RTCP dropped");
        }
    })
}

/// Re-injects packets (retransmissions) into `send`.
pub fn packets_into(send: PipelineHandle) -> PacketOutput {
    Arc::new(move |packet: PacketInfo| {
        if let Err(e) = send.try_send(packet) {
            debug!(error = %e, "retransmission dropped");
        }
    })
}

// ─── Transceiver ────────────────────────────────────────────────────────────

/// Terminal handoffs and the crypto seam.
pub struct TransceiverIo {
    /// Send side: bytes ready for the wire.
    pub wire: PacketOutput,
    /// Receive side: packets ready for the application.
    pub media: PacketOutput,
    pub crypto: Arc<dyn CryptoProvider>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransceiverStats {
    pub estimate_bps: u64,
    pub send_runner: RunnerStats,
    pub receive_runner: RunnerStats,
    pub send_stages: Vec<StageSnapshot>,
    pub receive_stages: Vec<StageSnapshot>,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub nack: NackStats,
    pub tcc_receive: TccReceiveStats,
    pub tcc_send: TccSendStats,
    pub estimator: EstimatorStats,
    pub remb: RembStats,
    /// Receive-side estimator behind the REMB reports we send.
    pub remb_estimator: EstimatorStats,
    pub rtx: RtxSendStats,
    pub keyframe: KeyframeStats,
    pub probing: ProbingStats,
}

pub struct Transceiver {
    clock: Clock,
    features: Features,
    cache: Arc<RtpPacketCache>,
    engine: Arc<TransportCcEngine>,
    encoder: Arc<Mutex<RtxEncoder>>,
    requester: Arc<Mutex<RetransmissionRequester>>,
    generator: Arc<Mutex<TccGenerator>>,
    remb: Arc<Mutex<RembEstimator>>,
    keyframe: KeyframeRequester,
    probing: ProbingDataSender,
    bus: Arc<EventBus>,
    last_estimate: Arc<Mutex<Bandwidth>>,
    scheduler: TaskScheduler,
    tasks: Vec<TaskId>,
    receive: PipelineRunner,
    send: PipelineRunner,
}

impl Transceiver {
    pub fn start(config: TransportConfig, clock: Clock, io: TransceiverIo) -> anyhow::Result<Self> {
        let features = config.features;
        let cache = Arc::new(RtpPacketCache::new(config.cache_capacity));
        let engine = Arc::new(TransportCcEngine::new(
            config.tcc_sender.clone(),
            Box::new(DelayBasedEstimator::new(config.estimator.clone())),
        ));
        let encoder = Arc::new(Mutex::new(RtxEncoder::new()));
        let requester = Arc::new(Mutex::new(RetransmissionRequester::new(config.nack.clone(), 0)));
        let generator = Arc::new(Mutex::new(TccGenerator::new(config.tcc_generator.clone(), 0)));
        let remb = Arc::new(Mutex::new(RembEstimator::new(config.remb.clone(), 0)));
        let bus = EventBus::new();

        let last_estimate = Arc::new(Mutex::new(config.estimator.start));
        {
            let last_estimate = Arc::clone(&last_estimate);
            bus.subscribe(move |event| {
                if let TransportEvent::BandwidthEstimate(bw) = event {
                    *last_estimate.lock().unwrap_or_else(|e| e.into_inner()) = *bw;
                }
            });
        }

        let send_graph = build_send_graph(
            &features,
            SendParts {
                engine: Arc::clone(&engine),
                cache: Arc::clone(&cache),
                wire: io.wire,
            },
            io.crypto.as_ref(),
            clock.clone(),
        )?;
        let send = PipelineRunner::spawn(send_graph, config.runner.clone())?;
        let rtcp_out = rtcp_into(send.handle());

        let events: EventOutput = {
            let bus = Arc::clone(&bus);
            Arc::new(move |event: TransportEvent| bus.publish(&event))
        };
        let receive_graph = build_receive_graph(
            &features,
            ReceiveParts {
                generator: Arc::clone(&generator),
                remb: Arc::clone(&remb),
                requester: Arc::clone(&requester),
                engine: Arc::clone(&engine),
                responder: NackResponder::new(
                    Arc::clone(&cache),
                    Arc::clone(&encoder),
                    packets_into(send.handle()),
                    features.rtx,
                ),
                rtcp_out: Arc::clone(&rtcp_out),
                events,
                media: io.media,
            },
            io.crypto.as_ref(),
            clock.clone(),
        )?;
        let receive = PipelineRunner::spawn(receive_graph, config.runner.clone())?;

        let scheduler = TaskScheduler::new("scheduler", clock.clone())?;
        let mut tasks = Vec::new();
        {
            let requester = Arc::clone(&requester);
            let out = Arc::clone(&rtcp_out);
            let interval = config.nack_poll_interval;
            tasks.push(scheduler.schedule_periodic("nack-poll", interval, move |now| {
                let nacks = requester.lock().unwrap_or_else(|e| e.into_inner()).poll(now);
                for nack in nacks {
                    out(RtcpPacket::Nack(nack));
                }
                Ok(())
            })?);
        }
        if let Some(period) = config.tcc_generator.periodic {
            let generator = Arc::clone(&generator);
            let out = Arc::clone(&rtcp_out);
            tasks.push(scheduler.schedule_periodic("tcc-feedback", period, move |now| {
                let report = generator.lock().unwrap_or_else(|e| e.into_inner()).tick(now);
                if let Some(feedback) = report {
                    out(RtcpPacket::TransportCc(feedback));
                }
                Ok(())
            })?);
        }
        {
            let remb = Arc::clone(&remb);
            let out = Arc::clone(&rtcp_out);
            tasks.push(scheduler.schedule_periodic("remb-report", REMB_POLL_INTERVAL, move |now| {
                let report = remb.lock().unwrap_or_else(|e| e.into_inner()).poll(now);
                if let Some(packet) = report {
                    out(RtcpPacket::Remb(packet));
                }
                Ok(())
            })?);
        }

        info!(tasks = tasks.len(), "transceiver started");
        let mut transceiver = Transceiver {
            keyframe: KeyframeRequester::new(config.keyframe.clone(), 0),
            probing: ProbingDataSender::new(config.probing.clone()),
            clock,
            features,
            cache,
            engine,
            encoder,
            requester,
            generator,
            remb,
            bus,
            last_estimate,
            scheduler,
            tasks,
            receive,
            send,
        };
        transceiver.apply_initial_features();
        Ok(transceiver)
    }

    fn apply_initial_features(&mut self) {
        let remb_enabled = self.features.remb;
        self.remb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_event(&TransportEvent::FeatureToggled {
                feature: Feature::Remb,
                enabled: remb_enabled,
            });
    }

    /// Hand an outgoing packet to the send pipeline.
    pub fn send_packet(&self, packet: PacketInfo) -> Result<(), PacketSendError> {
        self.send.try_send(packet)
    }

    /// Hand a packet read from the network to the receive pipeline.
    pub fn receive_packet(&self, packet: PacketInfo) -> Result<(), PacketSendError> {
        let packet = match packet.received_time {
            Some(_) => packet,
            None => packet.with_received_time(self.clock.now()),
        };
        self.receive.try_send(packet)
    }

    pub fn send_handle(&self) -> PipelineHandle {
        self.send.handle()
    }

    pub fn receive_handle(&self) -> PipelineHandle {
        self.receive.handle()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Apply a control event everywhere it matters.
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<(), PipelineError> {
        if let TransportEvent::FeatureToggled { feature, enabled } = &event {
            match feature {
                Feature::Rtx => self.features.rtx = *enabled,
                Feature::Nack => self.features.nack = *enabled,
                Feature::TransportCc => self.features.transport_cc = *enabled,
                Feature::Remb => self.features.remb = *enabled,
                Feature::PaddingTermination => self.features.padding_termination = *enabled,
                Feature::PacketTimeline => self.features.packet_timeline = *enabled,
            }
        }
        self.encoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle_event(&event);
        self.keyframe.handle_event(&event);
        self.probing.handle_event(&event);
        self.send.send_event(event.clone())?;
        self.receive.send_event(event.clone())?;
        self.bus.publish(&event);
        Ok(())
    }

    /// Ask the remote sender of `media_ssrc` for a keyframe. Returns false
    /// if the request was rate limited or no PLI/FIR is negotiated.
    pub fn request_keyframe(&mut self, media_ssrc: u32) -> bool {
        let Some(request) = self.keyframe.request_keyframe(media_ssrc, self.clock.now()) else {
            return false;
        };
        self.send
            .try_send(PacketInfo::new(request.to_bytes()))
            .is_ok()
    }

    /// Send about `num_bytes` of probing traffic for `media_ssrc`. Returns
    /// the number of packets queued.
    pub fn send_probing(&mut self, media_ssrc: u32, num_bytes: usize) -> usize {
        let rtx_enabled = self.features.rtx;
        let encoder = &self.encoder;
        let packets = self.probing.send_probing(media_ssrc, num_bytes, &self.cache, |original| {
            if !rtx_enabled {
                return None;
            }
            let mut encoder = encoder.lock().unwrap_or_else(|e| e.into_inner());
            if !encoder.has_rtx(media_ssrc) {
                return None;
            }
            encoder.encode(original).ok()
        });
        let mut queued = 0;
        for packet in packets {
            if self.send.try_send(packet).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Current send-side estimate: transport-cc when enabled, otherwise the
    /// last REMB received.
    pub fn estimate(&self) -> Bandwidth {
        if self.features.transport_cc {
            self.engine.estimate(self.clock.now())
        } else {
            *self.last_estimate.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    pub fn on_rtt_update(&self, rtt: Duration) {
        self.engine.on_rtt_update(rtt, self.clock.now());
    }

    pub fn stats(&self) -> TransceiverStats {
        let (remb, remb_estimator) = {
            let remb = self.remb.lock().unwrap_or_else(|e| e.into_inner());
            (remb.stats(), remb.estimator_stats())
        };
        TransceiverStats {
            estimate_bps: self.estimate().bps(),
            send_runner: self.send.stats(),
            receive_runner: self.receive.stats(),
            send_stages: self.send.graph_stats().snapshot(),
            receive_stages: self.receive.graph_stats().snapshot(),
            scheduler: self.scheduler.stats(),
            cache: self.cache.stats(),
            nack: self.requester.lock().unwrap_or_else(|e| e.into_inner()).stats(),
            tcc_receive: self.generator.lock().unwrap_or_else(|e| e.into_inner()).stats(),
            tcc_send: self.engine.stats(),
            estimator: self.engine.estimator_stats(),
            remb_estimator,
            remb,
            rtx: self.encoder.lock().unwrap_or_else(|e| e.into_inner()).stats(),
            keyframe: self.keyframe.stats(),
            probing: self.probing.stats(),
        }
    }

    /// Stop everything, in order. Idempotent.
    pub fn stop(&mut self) {
        for id in self.tasks.drain(..) {
            self.scheduler.cancel(id);
        }
        self.scheduler.shutdown();
        self.receive.stop();
        self.send.stop();
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.stop();
    }
}
