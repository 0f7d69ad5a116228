//! Error types for the transport layer.

use thiserror::Error;

/// Errors raised while reading, writing or decoding node connection traffic.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP connect did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Remote address.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A frame header or payload could not be parsed.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with it.
        reason: String,
    },

    /// The frame did not start with the protocol magic number.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Magic read off the wire.
        got: u32,
    },

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u16,
        /// Version read off the wire.
        got: u16,
    },

    /// Payload CRC did not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// CRC carried in the header.
        expected: u32,
        /// CRC computed over the received payload.
        computed: u32,
    },

    /// Payload length exceeds the protocol maximum.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced size.
        size: u32,
        /// Protocol maximum.
        max_size: u32,
    },

    /// The identity line sent before the first frame was unusable.
    #[error("invalid identity line: {reason}")]
    InvalidIdentity {
        /// What was wrong with it.
        reason: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Socket level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the peer sent something that violates the protocol,
    /// as opposed to a plain network failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidFrame { .. }
                | TransportError::InvalidMagic { .. }
                | TransportError::VersionMismatch { .. }
                | TransportError::ChecksumMismatch { .. }
                | TransportError::PayloadTooLarge { .. }
                | TransportError::InvalidIdentity { .. }
                | TransportError::Serialization(_)
        )
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
