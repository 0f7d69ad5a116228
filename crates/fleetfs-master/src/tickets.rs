//! Correlation tickets for one node session.
//!
//! A ticket is leased from a bounded pool, attached to one outbound command,
//! and matched to the node's response by value. Responses may arrive in any
//! order. The ticket returns to the pool only when the lease is dropped, which
//! happens after the waiter has consumed the response, so a ticket is never
//! reused while its answer could still be in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetfs_transport::message::{Command, Response};
use fleetfs_transport::tcp::FrameWriter;
use fleetfs_transport::Ticket;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::error::{NodeError, Result};

struct TicketState {
    free: Vec<u32>,
    pending: HashMap<Ticket, oneshot::Sender<Response>>,
    closed: bool,
}

/// Ticket pool and pending-response map of one session.
pub struct TicketRegistry {
    node: String,
    permits: Arc<Semaphore>,
    state: Mutex<TicketState>,
    reserve_timeout: Duration,
}

struct Lease {
    ticket: Ticket,
    registry: Arc<TicketRegistry>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(self.ticket);
    }
}

/// A ticket taken from the pool but not yet attached to a command.
pub struct ReservedTicket(Lease);

impl ReservedTicket {
    /// The ticket value.
    pub fn ticket(&self) -> Ticket {
        self.0.ticket
    }
}

/// A ticket whose command has been sent and whose response is awaited.
pub struct PendingTicket {
    lease: Lease,
    command: &'static str,
    receiver: oneshot::Receiver<Response>,
}

impl PendingTicket {
    /// The ticket value.
    pub fn ticket(&self) -> Ticket {
        self.lease.ticket
    }
}

impl TicketRegistry {
    /// Creates a pool of `pool_size` tickets for `node`.
    pub fn new(node: &str, pool_size: usize, reserve_timeout: Duration) -> Arc<Self> {
        let pool_size = pool_size.clamp(1, (u32::MAX - 1) as usize);
        Arc::new(Self {
            node: node.to_string(),
            permits: Arc::new(Semaphore::new(pool_size)),
            state: Mutex::new(TicketState {
                free: (0..pool_size as u32).rev().collect(),
                pending: HashMap::new(),
                closed: false,
            }),
            reserve_timeout,
        })
    }

    /// Takes a ticket, waiting at most the reserve timeout for one to free up.
    ///
    /// Fails with [`NodeError::NodeUnavailable`] if the session ends while
    /// waiting or the pool stays exhausted for the whole timeout.
    pub async fn reserve(self: &Arc<Self>) -> Result<ReservedTicket> {
        let permit = match tokio::time::timeout(
            self.reserve_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.unavailable()),
            Err(_) => {
                warn!(node = %self.node, "ticket pool exhausted");
                return Err(self.unavailable());
            }
        };
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.unavailable());
        }
        let raw = state.free.pop().ok_or_else(|| self.unavailable())?;
        Ok(ReservedTicket(Lease {
            ticket: Ticket::new(raw),
            registry: self.clone(),
            _permit: permit,
        }))
    }

    /// Records the ticket as pending and writes the command.
    pub async fn send(
        &self,
        reserved: ReservedTicket,
        command: &Command,
        writer: &FrameWriter,
    ) -> Result<PendingTicket> {
        let ticket = reserved.ticket();
        let frame = command.to_frame(ticket)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.unavailable());
            }
            state.pending.insert(ticket, tx);
        }
        let pending = PendingTicket {
            lease: reserved.0,
            command: command.name(),
            receiver: rx,
        };
        trace!(node = %self.node, %ticket, command = command.name(), "command sent");
        writer.write_frame(&frame).await?;
        Ok(pending)
    }

    /// Waits for the response to `pending`.
    ///
    /// A timeout is reported as [`NodeError::Timeout`] and closes the registry
    /// before the ticket is released: the node may still answer it, so no other
    /// command may hold that ticket. The caller then forces the node offline.
    /// An invalidated session yields [`NodeError::NodeUnavailable`].
    pub async fn await_response(&self, pending: PendingTicket, timeout: Duration) -> Result<Response> {
        let PendingTicket {
            lease,
            command,
            receiver,
        } = pending;
        let result = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.unavailable()),
            Err(_) => {
                self.invalidate_all();
                Err(NodeError::Timeout {
                    node: self.node.clone(),
                    command,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        drop(lease);
        result
    }

    /// Delivers a response from the read loop. Returns false if no one waits for `ticket`.
    pub fn complete(&self, ticket: Ticket, response: Response) -> bool {
        let sender = self.state.lock().pending.remove(&ticket);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(node = %self.node, %ticket, "response for a ticket nobody awaits");
                false
            }
        }
    }

    /// Ends the session: every waiter wakes with `NodeUnavailable` and no new
    /// ticket can be reserved. Returns the number of waiters woken.
    pub fn invalidate_all(&self) -> usize {
        let woken = {
            let mut state = self.state.lock();
            state.closed = true;
            let woken = state.pending.len();
            state.pending.clear();
            woken
        };
        self.permits.close();
        if woken > 0 {
            debug!(node = %self.node, woken, "outstanding tickets invalidated");
        }
        woken
    }

    /// Whether the session has been invalidated.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Commands sent and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Tickets that can be reserved right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn release(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.pending.remove(&ticket);
        if !state.closed {
            state.free.push(ticket.as_u32());
        }
    }

    fn unavailable(&self) -> NodeError {
        NodeError::NodeUnavailable {
            node: self.node.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetfs_transport::message::{Reply, RemoteError, RemoteErrorKind};
    use fleetfs_transport::tcp::{FrameReader, TcpConnection};
    use tokio::net::{TcpListener, TcpStream};

    async fn link() -> (FrameWriter, FrameReader) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_, writer) = TcpConnection::from_stream(client.unwrap()).unwrap().into_split();
        let (reader, _) = TcpConnection::from_stream(server.unwrap().0)
            .unwrap()
            .into_split();
        (writer, reader)
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let (writer, mut node) = link().await;
        let registry = TicketRegistry::new("nodeA", 4, Duration::from_secs(1));

        let first = registry.reserve().await.unwrap();
        let first = registry.send(first, &Command::Ping, &writer).await.unwrap();
        let second = registry.reserve().await.unwrap();
        let second = registry
            .send(second, &Command::Checksum { path: "/f".into() }, &writer)
            .await
            .unwrap();
        assert_ne!(first.ticket(), second.ticket());
        assert_eq!(registry.outstanding(), 2);

        let seen_first = node.read_frame().await.unwrap().ticket();
        let seen_second = node.read_frame().await.unwrap().ticket();
        assert!(registry.complete(seen_second, Ok(Reply::Checksum(7))));
        assert!(registry.complete(seen_first, Ok(Reply::Ack)));

        let timeout = Duration::from_secs(1);
        assert_eq!(
            registry.await_response(second, timeout).await.unwrap(),
            Ok(Reply::Checksum(7))
        );
        assert_eq!(registry.await_response(first, timeout).await.unwrap(), Ok(Reply::Ack));
        assert_eq!(registry.available(), 4);
    }

    #[tokio::test]
    async fn test_remote_error_is_delivered_as_response() {
        let (writer, mut node) = link().await;
        let registry = TicketRegistry::new("nodeA", 2, Duration::from_secs(1));
        let pending = registry
            .send(
                registry.reserve().await.unwrap(),
                &Command::Delete { path: "/gone".into() },
                &writer,
            )
            .await
            .unwrap();
        let ticket = node.read_frame().await.unwrap().ticket();
        let failure = RemoteError::new(RemoteErrorKind::NotFound, "/gone");
        registry.complete(ticket, Err(failure.clone()));
        let response = registry
            .await_response(pending, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, Err(failure));
    }

    #[tokio::test]
    async fn test_invalidate_wakes_every_waiter() {
        let (writer, _node) = link().await;
        let registry = TicketRegistry::new("nodeA", 8, Duration::from_secs(1));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let pending = registry
                .send(registry.reserve().await.unwrap(), &Command::Ping, &writer)
                .await
                .unwrap();
            let registry = registry.clone();
            waiters.push(tokio::spawn(async move {
                registry.await_response(pending, Duration::from_secs(30)).await
            }));
        }
        assert_eq!(registry.invalidate_all(), 3);
        assert!(registry.is_closed());
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(NodeError::NodeUnavailable { .. })
            ));
        }
        assert!(matches!(
            registry.reserve().await,
            Err(NodeError::NodeUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_reports_command() {
        let (writer, _node) = link().await;
        let registry = TicketRegistry::new("nodeA", 1, Duration::from_secs(1));
        let pending = registry
            .send(registry.reserve().await.unwrap(), &Command::Ping, &writer)
            .await
            .unwrap();
        let err = registry
            .await_response(pending, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Timeout { command: "ping", .. }));
        assert!(err.is_node_fatal());
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_ticket_never_reaches_another_waiter() {
        let (writer, mut node) = link().await;
        let registry = TicketRegistry::new("nodeA", 1, Duration::from_millis(50));
        let pending = registry
            .send(registry.reserve().await.unwrap(), &Command::Ping, &writer)
            .await
            .unwrap();
        let late = node.read_frame().await.unwrap().ticket();
        assert!(registry
            .await_response(pending, Duration::from_millis(20))
            .await
            .is_err());

        assert!(registry.is_closed());
        assert!(matches!(
            registry.reserve().await,
            Err(NodeError::NodeUnavailable { .. })
        ));
        assert!(!registry.complete(late, Ok(Reply::Ack)));
    }

    #[tokio::test]
    async fn test_ticket_held_until_response_consumed() {
        let (writer, mut node) = link().await;
        let registry = TicketRegistry::new("nodeA", 1, Duration::from_millis(30));
        let pending = registry
            .send(registry.reserve().await.unwrap(), &Command::Ping, &writer)
            .await
            .unwrap();
        let ticket = node.read_frame().await.unwrap().ticket();
        assert!(registry.complete(ticket, Ok(Reply::Ack)));

        // answered but not consumed: the pool is still empty
        assert!(matches!(
            registry.reserve().await,
            Err(NodeError::NodeUnavailable { .. })
        ));

        registry
            .await_response(pending, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let again = registry.reserve().await.unwrap();
        assert_eq!(again.ticket(), ticket);
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let registry = TicketRegistry::new("nodeA", 1, Duration::from_secs(1));
        assert!(!registry.complete(Ticket::new(0), Ok(Reply::Ack)));
    }
}
