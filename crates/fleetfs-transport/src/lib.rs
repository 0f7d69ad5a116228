#![warn(missing_docs)]

//! fleetfs transport subsystem: master/node frame codec, message vocabulary, TCP framing

pub mod error;
pub mod keepalive;
pub mod message;
pub mod protocol;
pub mod tcp;

pub use error::{Result, TransportError};
pub use protocol::{Frame, Opcode, Ticket};
