//! Error types for the sACN library.

use std::io;

use thiserror::Error;

/// Result type alias for sACN operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sACN operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Packet encode/decode failure.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Universe number outside the ranges the operation accepts.
    #[error("invalid universe number: {0}")]
    InvalidUniverse(u16),

    /// Operation on a universe that was never started.
    #[error("universe {0} is not initialised, use start_universe() first")]
    UniverseNotStarted(u16),

    /// `start_universe` on a universe that is already running.
    #[error("universe {0} is already enabled")]
    UniverseAlreadyStarted(u16),

    /// Source name exceeds the 64-byte field.
    #[error("source name is too long: {0} bytes (maximum is 64)")]
    SourceNameTooLong(usize),

    /// The universe's channel is closed (its send task has exited).
    #[error("channel for universe {0} is closed")]
    ChannelClosed(u16),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Packet parsing and construction errors.
///
/// A receiver treats every variant as non-fatal: the datagram is dropped
/// and the loop continues.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("buffer too short for {layer} layer: {len} bytes")]
    Truncated { layer: &'static str, len: usize },

    #[error("incorrect preamble size in root layer")]
    InvalidPreamble,

    #[error("incorrect postamble size in root layer")]
    InvalidPostamble,

    #[error("incorrect ACN packet identifier")]
    InvalidIdentifier,

    #[error("incorrect packet size {declared} != {actual}")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("invalid root vector")]
    InvalidRootVector,

    #[error("invalid frame vector")]
    InvalidFrameVector,

    #[error("invalid DMP vector")]
    InvalidDmpVector,

    #[error("invalid DMP format fields")]
    InvalidDmpFormat,

    #[error("invalid discovery vector")]
    InvalidDiscoveryVector,

    #[error("current page > last page")]
    PageOutOfRange,

    #[error("source name has to be <= 64 bytes")]
    SourceNameTooLong,

    #[error("universe list is full, create a new packet with the next page")]
    UniverseListFull,

    #[error("unhandled packet type")]
    Unhandled,
}
