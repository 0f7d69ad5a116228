//! Message vocabulary exchanged between the master and its storage nodes.
//!
//! Each message kind maps to one [`Opcode`]; its payload is the bincode
//! encoding of the matching struct below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, Opcode, Ticket};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

// ============================================================================
// Handshake
// ============================================================================

/// Master's answer to the identity line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeReply {
    /// The node may proceed into the ticketed protocol.
    Accepted,
    /// The node was refused; the master closes the connection after sending this.
    Rejected {
        /// Human readable reason.
        reason: String,
    },
}

impl HandshakeReply {
    /// Wraps the reply in an unsolicited frame.
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::unsolicited(
            Opcode::HandshakeReply,
            serialize_message(self)?,
        ))
    }

    /// Decodes the reply; any other opcode is a protocol violation.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.opcode() != Opcode::HandshakeReply {
            return Err(TransportError::InvalidFrame {
                reason: format!("expected handshake reply, got {:?}", frame.opcode()),
            });
        }
        deserialize_message(&frame.payload)
    }
}

// ============================================================================
// Payload structs
// ============================================================================

/// One entry of a directory listing reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Entry name within its directory.
    pub name: String,
    /// Size in bytes (zero for directories).
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub last_modified: u64,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

impl ListingEntry {
    /// Convenience constructor for a file entry.
    pub fn file(name: &str, size: u64, last_modified: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            last_modified,
            is_directory: false,
        }
    }

    /// Convenience constructor for a directory entry.
    pub fn directory(name: &str, last_modified: u64) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            last_modified,
            is_directory: true,
        }
    }
}

/// Parameters of a remerge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemergeRequest {
    /// Root of the walk, normally `/`.
    pub path: String,
    /// Only report entries modified after `cutoff_ms`.
    pub partial: bool,
    /// Cutoff used when `partial` is set.
    pub cutoff_ms: u64,
    /// Master's wall clock, so the node can correct for skew.
    pub master_time_ms: u64,
}

/// Parameters of a rename command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    /// Existing path.
    pub from: String,
    /// Destination directory.
    pub to_dir: String,
    /// Destination name within `to_dir`.
    pub to_name: String,
}

/// Parameters of a transfer abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransferRequest {
    /// Transfer to abort.
    pub transfer_id: u64,
    /// Reason passed on to the node's log.
    pub reason: String,
}

/// Free and total space on a node, plus its transfer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStatus {
    /// Bytes free across the node's roots.
    pub free_bytes: u64,
    /// Total bytes across the node's roots.
    pub total_bytes: u64,
    /// Transfers currently sending data.
    pub transfers_sending: u32,
    /// Transfers currently receiving data.
    pub transfers_receiving: u32,
}

/// Direction of a transfer from the node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Node is sending file bytes.
    Sending,
    /// Node is receiving file bytes.
    Receiving,
}

/// Progress report for one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Node-assigned transfer id.
    pub transfer_id: u64,
    /// Which way the bytes flow.
    pub direction: TransferDirection,
    /// File being transferred.
    pub path: String,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Time spent so far.
    pub elapsed_ms: u64,
    /// Set on the last report for this transfer.
    pub finished: bool,
    /// Set when the transfer ended in failure.
    pub error: Option<String>,
}

/// One directory of a remerge stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemergeEntry {
    /// Directory the listing describes.
    pub directory: String,
    /// Direct children of `directory`.
    pub listing: Vec<ListingEntry>,
    /// Set on the message that ends the stream.
    pub is_final: bool,
}

// ============================================================================
// Commands and responses
// ============================================================================

/// Category of a failure reported by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The path does not exist on the node.
    NotFound,
    /// The destination already exists on the node.
    AlreadyExists,
    /// The node lacks permission.
    PermissionDenied,
    /// Local I/O failure on the node.
    Io,
    /// The node does not implement the command.
    Unsupported,
}

/// A failure the node reported for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    /// Failure category.
    pub kind: RemoteErrorKind,
    /// Node-side detail.
    pub message: String,
}

impl RemoteError {
    /// Builds a remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the failure means the object is already gone on the node.
    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Command done, nothing to report.
    Ack,
    /// Longest path the node's filesystem accepts.
    MaxPathLength(u32),
    /// Whether the node is ready for TLS transfers.
    TlsCapability(bool),
    /// CRC32 of the requested file.
    Checksum(u32),
    /// Current disk status.
    DiskStatus(DiskStatus),
}

/// What a node sends back for a ticketed command.
pub type Response = std::result::Result<Reply, RemoteError>;

/// Builds the response frame for `ticket`.
pub fn response_frame(ticket: Ticket, response: &Response) -> Result<Frame> {
    Ok(Frame::new(
        Opcode::Response,
        ticket,
        serialize_message(response)?,
    ))
}

/// A command the master issues to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Query maximum path length.
    MaxPathLength,
    /// Query TLS readiness.
    TlsCapability,
    /// Start streaming the file listing.
    Remerge(RemergeRequest),
    /// Pause the listing stream.
    RemergePause,
    /// Resume the listing stream.
    RemergeResume,
    /// Liveness probe.
    Ping,
    /// Delete a path.
    Delete {
        /// Path to delete.
        path: String,
    },
    /// Rename a path.
    Rename(RenameRequest),
    /// Compute a file checksum.
    Checksum {
        /// File to checksum.
        path: String,
    },
    /// Report disk status.
    CheckDiskStatus,
    /// Abort a transfer.
    AbortTransfer(AbortTransferRequest),
    /// Shut the node down.
    Shutdown,
}

impl Command {
    /// Opcode this command travels under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::MaxPathLength => Opcode::MaxPathLength,
            Command::TlsCapability => Opcode::TlsCapability,
            Command::Remerge(_) => Opcode::Remerge,
            Command::RemergePause => Opcode::RemergePause,
            Command::RemergeResume => Opcode::RemergeResume,
            Command::Ping => Opcode::Ping,
            Command::Delete { .. } => Opcode::Delete,
            Command::Rename(_) => Opcode::Rename,
            Command::Checksum { .. } => Opcode::Checksum,
            Command::CheckDiskStatus => Opcode::CheckDiskStatus,
            Command::AbortTransfer(_) => Opcode::AbortTransfer,
            Command::Shutdown => Opcode::Shutdown,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::MaxPathLength => "maxpath",
            Command::TlsCapability => "tlscapability",
            Command::Remerge(_) => "remerge",
            Command::RemergePause => "remergepause",
            Command::RemergeResume => "remergeresume",
            Command::Ping => "ping",
            Command::Delete { .. } => "delete",
            Command::Rename(_) => "rename",
            Command::Checksum { .. } => "checksum",
            Command::CheckDiskStatus => "checkdiskstatus",
            Command::AbortTransfer(_) => "aborttransfer",
            Command::Shutdown => "shutdown",
        }
    }

    /// Encodes the command under `ticket`.
    pub fn to_frame(&self, ticket: Ticket) -> Result<Frame> {
        let payload = match self {
            Command::Remerge(req) => serialize_message(req)?,
            Command::Delete { path } | Command::Checksum { path } => serialize_message(path)?,
            Command::Rename(req) => serialize_message(req)?,
            Command::AbortTransfer(req) => serialize_message(req)?,
            Command::MaxPathLength
            | Command::TlsCapability
            | Command::RemergePause
            | Command::RemergeResume
            | Command::Ping
            | Command::CheckDiskStatus
            | Command::Shutdown => Vec::new(),
        };
        Ok(Frame::new(self.opcode(), ticket, payload))
    }

    /// Decodes a command frame, as a node does.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let payload = &frame.payload;
        let command = match frame.opcode() {
            Opcode::MaxPathLength => Command::MaxPathLength,
            Opcode::TlsCapability => Command::TlsCapability,
            Opcode::Remerge => Command::Remerge(deserialize_message(payload)?),
            Opcode::RemergePause => Command::RemergePause,
            Opcode::RemergeResume => Command::RemergeResume,
            Opcode::Ping => Command::Ping,
            Opcode::Delete => Command::Delete {
                path: deserialize_message(payload)?,
            },
            Opcode::Rename => Command::Rename(deserialize_message(payload)?),
            Opcode::Checksum => Command::Checksum {
                path: deserialize_message(payload)?,
            },
            Opcode::CheckDiskStatus => Command::CheckDiskStatus,
            Opcode::AbortTransfer => Command::AbortTransfer(deserialize_message(payload)?),
            Opcode::Shutdown => Command::Shutdown,
            other => {
                return Err(TransportError::InvalidFrame {
                    reason: format!("{other:?} is not a command"),
                })
            }
        };
        Ok(command)
    }
}

// ============================================================================
// Node -> master traffic
// ============================================================================

/// A decoded message read by the master from a node connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Answer to a ticketed command.
    Response {
        /// Ticket of the command this answers.
        ticket: Ticket,
        /// The node's answer.
        response: Response,
    },
    /// One directory of a remerge stream.
    RemergeEntry(RemergeEntry),
    /// Unsolicited disk status.
    DiskStatus(DiskStatus),
    /// Unsolicited transfer progress.
    TransferStatus(TransferStatus),
    /// Well-formed frame of a kind this build does not know.
    Unknown {
        /// Raw opcode.
        opcode: u16,
    },
}

impl Inbound {
    /// Decodes a frame received from a node.
    ///
    /// Unknown opcodes decode to [`Inbound::Unknown`]; known opcodes with a bad
    /// payload, or opcodes only the master may send, are errors.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let payload = &frame.payload;
        match frame.opcode() {
            Opcode::Response => {
                if frame.ticket().is_unsolicited() {
                    return Err(TransportError::InvalidFrame {
                        reason: "response without a ticket".to_string(),
                    });
                }
                Ok(Inbound::Response {
                    ticket: frame.ticket(),
                    response: deserialize_message(payload)?,
                })
            }
            Opcode::RemergeEntry => Ok(Inbound::RemergeEntry(deserialize_message(payload)?)),
            Opcode::DiskStatus => Ok(Inbound::DiskStatus(deserialize_message(payload)?)),
            Opcode::TransferStatus => Ok(Inbound::TransferStatus(deserialize_message(payload)?)),
            Opcode::Unknown(raw) => Ok(Inbound::Unknown { opcode: raw }),
            other => Err(TransportError::InvalidFrame {
                reason: format!("node may not send {other:?}"),
            }),
        }
    }

    /// Encodes an unsolicited message, as a node does.
    pub fn to_frame(&self) -> Result<Frame> {
        match self {
            Inbound::Response { ticket, response } => response_frame(*ticket, response),
            Inbound::RemergeEntry(entry) => Ok(Frame::unsolicited(
                Opcode::RemergeEntry,
                serialize_message(entry)?,
            )),
            Inbound::DiskStatus(status) => Ok(Frame::unsolicited(
                Opcode::DiskStatus,
                serialize_message(status)?,
            )),
            Inbound::TransferStatus(status) => Ok(Frame::unsolicited(
                Opcode::TransferStatus,
                serialize_message(status)?,
            )),
            Inbound::Unknown { opcode } => Ok(Frame::unsolicited(Opcode::from(*opcode), Vec::new())),
        }
    }
}
