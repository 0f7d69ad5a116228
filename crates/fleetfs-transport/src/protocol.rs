//! Frame codec for the master/node protocol.
//!
//! Every message after the identity line travels as one frame: a fixed
//! 20-byte big-endian header followed by a bincode payload.
//!
//! ```text
//! magic:4 | version:2 | opcode:2 | ticket:4 | payload_length:4 | crc32:4
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0xF1EE_7001;

/// Protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest payload a peer may announce (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Correlation token carried by every frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u32);

impl Ticket {
    /// Ticket value reserved for messages nobody asked for.
    pub const UNSOLICITED: Ticket = Ticket(u32::MAX);

    /// Wraps a raw ticket value.
    pub fn new(raw: u32) -> Self {
        Ticket(raw)
    }

    /// Raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the unsolicited sentinel.
    pub fn is_unsolicited(&self) -> bool {
        *self == Self::UNSOLICITED
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unsolicited() {
            write!(f, "unsolicited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Message kinds understood by this protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Master's accept/reject answer to the identity line.
    HandshakeReply,
    /// Ask the node for its maximum path length.
    MaxPathLength,
    /// Ask the node whether it can do TLS transfers.
    TlsCapability,
    /// Ask the node to stream its file listing.
    Remerge,
    /// Ask the node to stop streaming listing data for now.
    RemergePause,
    /// Ask the node to continue streaming listing data.
    RemergeResume,
    /// Liveness probe.
    Ping,
    /// Delete a path on the node.
    Delete,
    /// Rename a path on the node.
    Rename,
    /// Compute a CRC32 checksum of a file on the node.
    Checksum,
    /// Ask the node for its disk status.
    CheckDiskStatus,
    /// Abort an in-flight transfer.
    AbortTransfer,
    /// Ask the node to shut down.
    Shutdown,
    /// Answer to a ticketed command.
    Response,
    /// One directory of a remerge listing.
    RemergeEntry,
    /// Unsolicited disk status report.
    DiskStatus,
    /// Unsolicited transfer progress report.
    TransferStatus,
    /// A kind this build does not know. The payload is skipped.
    Unknown(u16),
}

impl Opcode {
    /// Wire value of this opcode.
    pub fn as_u16(&self) -> u16 {
        match self {
            Opcode::HandshakeReply => 0x0001,
            Opcode::MaxPathLength => 0x0101,
            Opcode::TlsCapability => 0x0102,
            Opcode::Remerge => 0x0103,
            Opcode::RemergePause => 0x0104,
            Opcode::RemergeResume => 0x0105,
            Opcode::Ping => 0x0106,
            Opcode::Delete => 0x0107,
            Opcode::Rename => 0x0108,
            Opcode::Checksum => 0x0109,
            Opcode::CheckDiskStatus => 0x010A,
            Opcode::AbortTransfer => 0x010B,
            Opcode::Shutdown => 0x010C,
            Opcode::Response => 0x0200,
            Opcode::RemergeEntry => 0x0301,
            Opcode::DiskStatus => 0x0302,
            Opcode::TransferStatus => 0x0303,
            Opcode::Unknown(raw) => *raw,
        }
    }

    /// Whether this opcode is a command sent from master to node.
    pub fn is_command(&self) -> bool {
        (0x0100..0x0200).contains(&self.as_u16()) && !matches!(self, Opcode::Unknown(_))
    }
}

impl From<u16> for Opcode {
    fn from(raw: u16) -> Self {
        match raw {
            0x0001 => Opcode::HandshakeReply,
            0x0101 => Opcode::MaxPathLength,
            0x0102 => Opcode::TlsCapability,
            0x0103 => Opcode::Remerge,
            0x0104 => Opcode::RemergePause,
            0x0105 => Opcode::RemergeResume,
            0x0106 => Opcode::Ping,
            0x0107 => Opcode::Delete,
            0x0108 => Opcode::Rename,
            0x0109 => Opcode::Checksum,
            0x010A => Opcode::CheckDiskStatus,
            0x010B => Opcode::AbortTransfer,
            0x010C => Opcode::Shutdown,
            0x0200 => Opcode::Response,
            0x0301 => Opcode::RemergeEntry,
            0x0302 => Opcode::DiskStatus,
            0x0303 => Opcode::TransferStatus,
            other => Opcode::Unknown(other),
        }
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u16,
    /// Message kind
    pub opcode: Opcode,
    /// Correlation ticket
    pub ticket: Ticket,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Encodes the header into its fixed wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.opcode.as_u16().to_be_bytes());
        buf[8..12].copy_from_slice(&self.ticket.as_u32().to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Decodes and validates a header read off the wire.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let opcode = Opcode::from(u16::from_be_bytes([buf[6], buf[7]]));
        let ticket = Ticket::new(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]));
        let payload_length = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let checksum = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        Ok(Self {
            magic,
            version,
            opcode,
            ticket,
            payload_length,
            checksum,
        })
    }
}

/// A single frame: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame, computing length and checksum from the payload.
    pub fn new(opcode: Opcode, ticket: Ticket, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            opcode,
            ticket,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Builds a frame that carries no correlation ticket.
    pub fn unsolicited(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self::new(opcode, Ticket::UNSOLICITED, payload)
    }

    /// Message kind.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Correlation ticket.
    pub fn ticket(&self) -> Ticket {
        self.header.ticket
    }

    /// Serializes header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Checks the payload against the length and CRC in the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() != self.header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload is {} bytes, header says {}",
                    self.payload.len(),
                    self.header.payload_length
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}
