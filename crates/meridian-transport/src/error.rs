//! Transport-level error type.
//!
//! Parse and lookup failures surface here. Per-packet failures inside a
//! pipeline are turned into discards and counters by the stage that sees
//! them, so these errors rarely escape past a single call.

use thiserror::Error;

/// Errors produced while parsing or rewriting RTP/RTCP packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("packet too short: need {needed} bytes, have {have}")]
    TooShort { needed: usize, have: usize },

    #[error("unsupported RTP/RTCP version {0}")]
    BadVersion(u8),

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("no SSRC association for {0:#010x}")]
    MissingAssociation(u32),

    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fail with [`Error::TooShort`] unless `buf` holds at least `needed` bytes.
pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        Err(Error::TooShort {
            needed,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}
