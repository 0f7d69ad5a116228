#![warn(missing_docs)]

//! fleetfs master subsystem: storage node registry, ticketed command sessions, remerge reconciliation, offline operation queues

pub mod admin;
pub mod backpressure;
pub mod config;
pub mod connection;
pub mod context;
pub mod daemon;
pub mod error;
pub mod node;
pub mod offline_queue;
pub mod registry;
pub mod remerge;
pub mod tickets;

pub use admin::{CapacityReport, MasterAdmin, NodeReport, ThroughputReport};
pub use config::{MasterConfig, NodeBootstrap, SessionConfig};
pub use connection::SlaveConnection;
pub use context::MasterContext;
pub use daemon::MasterDaemon;
pub use error::{NodeError, Result};
pub use node::{NodeEvent, NodeState, SlaveNode};
pub use offline_queue::{OfflineOperationQueue, ReplayReport};
pub use registry::{BroadcastReport, SlaveRegistry};
pub use remerge::{RemergeReconciler, RemergeStats, RemoteAction};
pub use tickets::TicketRegistry;
