//! Error types for node sessions, the registry and the admin surface.

use fleetfs_meta::MetaError;
use fleetfs_transport::message::RemoteError;
use fleetfs_transport::TransportError;

/// Errors raised while talking to or managing a storage node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node has no live session, or its session ended while waiting.
    #[error("node {node} is unavailable")]
    NodeUnavailable {
        /// Node name.
        node: String,
    },

    /// The node did not answer within its configured timeout.
    #[error("node {node} did not answer {command} within {timeout_ms} ms")]
    Timeout {
        /// Node name.
        node: String,
        /// Command that went unanswered.
        command: &'static str,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The node answered with a failure of its own.
    #[error("node reported: {0}")]
    Remote(RemoteError),

    /// The node sent something malformed or unexpected.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Socket or framing failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Namespace or persistence failure.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// No node with this name is configured.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// A node with this name is already configured.
    #[error("node {0} already exists")]
    NodeExists(String),

    /// The operation is not legal in the node's current state.
    #[error("node {node} is {state}, cannot {operation}")]
    InvalidState {
        /// Node name.
        node: String,
        /// State the node was in.
        state: &'static str,
        /// What was attempted.
        operation: &'static str,
    },

    /// The connecting peer was turned away during the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

impl NodeError {
    /// Whether the failure invalidates the whole session and must force the node offline.
    ///
    /// Remote failures concern one command only; an unavailable node is already offline.
    pub fn is_node_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout { .. } | NodeError::Protocol(_) | NodeError::Transport(_)
        )
    }

    /// Whether the node reported that the target path does not exist.
    pub fn is_remote_not_found(&self) -> bool {
        matches!(self, NodeError::Remote(e) if e.is_not_found())
    }

    /// Whether the node reported that the destination already exists.
    pub fn is_remote_already_exists(&self) -> bool {
        matches!(
            self,
            NodeError::Remote(e) if e.kind == fleetfs_transport::message::RemoteErrorKind::AlreadyExists
        )
    }
}

/// Result alias for master operations.
pub type Result<T> = std::result::Result<T, NodeError>;
