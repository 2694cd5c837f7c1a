//! Error taxonomy for the secure FEC channel and its callers.
//!
//! Per-packet failures that §7 classifies as Transient or Protocol (AEAD
//! failure, short frame, stale session, RS-decode impossibility) are not
//! propagated as `Result` across thread boundaries — they are counted on an
//! atomic and logged at `debug`/`trace`. `ChannelError` exists for the
//! handful of call sites that need to pattern-match on *why* something was
//! rejected (tests, and the orchestrator's decision to force a session
//! reset). Resource and Driver failures (§7) use `anyhow::Result` instead,
//! the way the rest of this crate does.

use std::fmt;

/// Reasons a frame or session packet was rejected by the secure FEC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Frame shorter than the minimum size for its claimed packet type.
    ShortFrame { len: usize, needed: usize },
    /// First byte did not match `SESSION` or `DATA`.
    UnknownPacketType(u8),
    /// Sealed-box unwrap of a session packet failed authentication.
    SessionUnsealFailed,
    /// Session descriptor decoded but violated `k <= n` or `n == 0`.
    InvalidFecParams { k: u8, n: u8 },
    /// Session's `(epoch, channel_id)` did not strictly dominate the last accepted one.
    StaleSession { epoch: u64, channel_id: u32 },
    /// AEAD tag verification failed for a data fragment.
    DecryptFailed { block_index: u64, fragment_index: u8 },
    /// Fragment index was outside `[0, n)` for the channel's current session.
    FragmentIndexOutOfRange { fragment_index: u8, n: u8 },
    /// No session established yet; data frame dropped.
    NoSession,
    /// Block index fell below the ring's retained window.
    BlockTooOld { block_index: u64, window_min: u64 },
    /// Reed-Solomon reconstruction ran with fewer than `k` shards present.
    FecDecodeImpossible { block_index: u64, have: usize, k: u8 },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ShortFrame { len, needed } => {
                write!(f, "frame too short: {len} bytes, needed at least {needed}")
            }
            ChannelError::UnknownPacketType(t) => write!(f, "unknown packet type 0x{t:02x}"),
            ChannelError::SessionUnsealFailed => write!(f, "session packet failed authentication"),
            ChannelError::InvalidFecParams { k, n } => {
                write!(f, "invalid FEC params: k={k} n={n}")
            }
            ChannelError::StaleSession { epoch, channel_id } => write!(
                f,
                "session (epoch={epoch}, channel_id={channel_id}) does not dominate the accepted one"
            ),
            ChannelError::DecryptFailed { block_index, fragment_index } => write!(
                f,
                "AEAD decrypt failed for block {block_index} fragment {fragment_index}"
            ),
            ChannelError::FragmentIndexOutOfRange { fragment_index, n } => write!(
                f,
                "fragment index {fragment_index} out of range for n={n}"
            ),
            ChannelError::NoSession => write!(f, "no session established"),
            ChannelError::BlockTooOld { block_index, window_min } => write!(
                f,
                "block {block_index} is older than retained window start {window_min}"
            ),
            ChannelError::FecDecodeImpossible { block_index, have, k } => write!(
                f,
                "block {block_index} had only {have}/{k} shards at eviction, cannot reconstruct"
            ),
        }
    }
}

impl std::error::Error for ChannelError {}
