//! Encrypt/decrypt seam.
//!
//! The transform itself (SRTP/SRTCP) is supplied from outside; this stage
//! only applies it and turns failures into discards.

use bytes::BytesMut;
use quanta::Instant;
use thiserror::Error;
use tracing::warn;

use meridian_transport::packet::PacketInfo;
use meridian_transport::stats::StatBlock;

use crate::stage::{StageBehavior, StageOutput, Transformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

#[derive(Debug, Error)]
#[error("{kind:?} transform failed: {reason}")]
pub struct TransformError {
    pub kind: PacketKind,
    pub reason: String,
}

/// An opaque protect/unprotect transform. Rewrites the buffer in place.
pub trait PacketTransform: Send {
    fn transform(&mut self, kind: PacketKind, buf: &mut BytesMut) -> Result<(), TransformError>;
}

/// Passes packets through unchanged. Used before keys are available and in
/// tests.
#[derive(Debug, Default)]
pub struct NullTransform;

impl PacketTransform for NullTransform {
    fn transform(&mut self, _kind: PacketKind, _buf: &mut BytesMut) -> Result<(), TransformError> {
        Ok(())
    }
}

impl<F> PacketTransform for F
where
    F: FnMut(PacketKind, &mut BytesMut) -> Result<(), TransformError> + Send,
{
    fn transform(&mut self, kind: PacketKind, buf: &mut BytesMut) -> Result<(), TransformError> {
        self(kind, buf)
    }
}

/// Supplies fresh transforms for each direction and packet kind.
pub trait CryptoProvider: Send + Sync {
    fn encryptor(&self, kind: PacketKind) -> Box<dyn PacketTransform>;
    fn decryptor(&self, kind: PacketKind) -> Box<dyn PacketTransform>;
}

impl CryptoProvider for NullTransform {
    fn encryptor(&self, _kind: PacketKind) -> Box<dyn PacketTransform> {
        Box::new(NullTransform)
    }

    fn decryptor(&self, _kind: PacketKind) -> Box<dyn PacketTransform> {
        Box::new(NullTransform)
    }
}

/// Applies a [`PacketTransform`] to one packet kind.
pub struct CryptoStage {
    name: String,
    kind: PacketKind,
    transform: Option<Box<dyn PacketTransform>>,
    processed: u64,
    failures: u64,
}

impl CryptoStage {
    pub fn new(name: &str, kind: PacketKind, transform: Box<dyn PacketTransform>) -> Self {
        CryptoStage {
            name: name.to_string(),
            kind,
            transform: Some(transform),
            processed: 0,
            failures: 0,
        }
    }
}

impl StageBehavior for CryptoStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new()
            .with("processed", self.processed)
            .with("failures", self.failures)
    }

    /// Drops the transform and any key material it holds.
    fn teardown(&mut self) {
        self.transform = None;
    }
}

impl Transformer for CryptoStage {
    fn transform(&mut self, mut packet: PacketInfo, _now: Instant) -> StageOutput {
        let Some(transform) = self.transform.as_mut() else {
            return StageOutput::Discard(packet);
        };
        match transform.transform(self.kind, &mut packet.buffer) {
            Ok(()) => {
                self.processed += 1;
                StageOutput::Forward(packet)
            }
            Err(e) => {
                self.failures += 1;
                warn!(stage = %self.name, error = %e, "crypto transform failed, packet dropped");
                StageOutput::Discard(packet)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    #[test]
    fn failure_discards_and_counts() {
        let mut calls = 0u32;
        let flaky = move |kind: PacketKind, buf: &mut BytesMut| {
            calls += 1;
            if calls % 2 == 0 {
                Err(TransformError {
                    kind,
                    reason: "auth tag mismatch".into(),
                })
            } else {
                buf.extend_from_slice(&[0xAA]);
                Ok(())
            }
        };
        let mut stage = CryptoStage::new("decrypt", PacketKind::Rtp, Box::new(flaky));
        let now = Clock::new().now();

        let out = stage.transform(PacketInfo::new(BytesMut::from(&[1u8, 2][..])), now);
        assert!(matches!(out, StageOutput::Forward(ref p) if p.buffer[..] == [1, 2, 0xAA]));
        let out = stage.transform(PacketInfo::new(BytesMut::from(&[1u8][..])), now);
        assert!(matches!(out, StageOutput::Discard(_)));
        assert_eq!(stage.stats().count("failures"), 1);
        assert_eq!(stage.stats().count("processed"), 1);
    }

    #[test]
    fn teardown_releases_transform() {
        let mut stage = CryptoStage::new("encrypt", PacketKind::Rtcp, Box::new(NullTransform));
        let now = Clock::new().now();
        stage.teardown();
        let out = stage.transform(PacketInfo::new(BytesMut::from(&[1u8][..])), now);
        assert!(matches!(out, StageOutput::Discard(_)));
    }
}
