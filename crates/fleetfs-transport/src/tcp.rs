//! Framed TCP links between the master and its storage nodes.
//!
//! A node opens the link, writes its identity line, and from then on both
//! sides exchange [`Frame`]s. The master splits each accepted link so that one
//! read loop owns the receive side while any number of tasks share the send side.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// Longest identity line a node may send, newline included.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Socket options for node links.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Give up dialing after this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Set TCP_NODELAY; commands are small and latency bound.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            nodelay: true,
        }
    }
}

/// Opens and accepts node links.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// A transport applying `config` to every socket.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Dials `addr`. Used by nodes and by tests standing in for them.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };
        self.prepare(stream)
    }

    /// Binds the listener nodes dial.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Waits for the next node to dial in.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpConnection> {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "node link accepted");
        self.prepare(stream)
    }

    fn prepare(&self, stream: TcpStream) -> Result<TcpConnection> {
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        TcpConnection::from_stream(stream)
    }
}

/// A freshly established connection, not yet split into reader and writer.
pub struct TcpConnection {
    reader: FrameReader,
    writer: FrameWriter,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader { read },
            writer: FrameWriter {
                write: Mutex::new(write),
            },
            peer_addr,
        })
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reader half, for the handshake phase.
    pub fn reader(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    /// Writer half, for the handshake phase.
    pub fn writer(&self) -> &FrameWriter {
        &self.writer
    }

    /// Splits into the half owned by the read loop and the shared send half.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a connection. Owned by exactly one task.
pub struct FrameReader {
    read: OwnedReadHalf,
}

impl FrameReader {
    /// Receives one frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read_exact_or_closed(&mut self.read, &mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read_exact_or_closed(&mut self.read, &mut payload).await?;
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Reads the newline-terminated identity line a node sends before any frame.
    pub async fn read_identity(&mut self) -> Result<String> {
        let mut line = Vec::with_capacity(32);
        loop {
            let byte = match self.read.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(TransportError::ConnectionClosed)
                }
                Err(e) => return Err(e.into()),
            };
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() >= MAX_IDENTITY_LEN {
                return Err(TransportError::InvalidIdentity {
                    reason: format!("longer than {MAX_IDENTITY_LEN} bytes"),
                });
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let name = String::from_utf8(line).map_err(|_| TransportError::InvalidIdentity {
            reason: "not valid UTF-8".to_string(),
        })?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(TransportError::InvalidIdentity {
                reason: "empty".to_string(),
            });
        }
        Ok(name)
    }
}

async fn read_exact_or_closed(read: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<()> {
    match read.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransportError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Sending half of a connection. Concurrent senders are serialized.
pub struct FrameWriter {
    write: Mutex<OwnedWriteHalf>,
}

impl FrameWriter {
    /// Writes one whole frame; concurrent callers never interleave.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    /// Sends the identity line. Only a node calls this.
    pub async fn write_identity(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() >= MAX_IDENTITY_LEN || name.contains('\n') {
            return Err(TransportError::InvalidIdentity {
                reason: format!("cannot send {name:?}"),
            });
        }
        let mut write = self.write.lock().await;
        write.write_all(name.as_bytes()).await?;
        write.write_all(b"\n").await?;
        write.flush().await?;
        Ok(())
    }

    /// Half-closes the connection.
    pub async fn shutdown(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, Ticket};

    async fn pair() -> (TcpConnection, TcpConnection) {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = tokio::spawn(async move {
            TcpTransport::new(TcpTransportConfig::default())
                .connect(&addr)
                .await
                .unwrap()
        });
        let server = transport.accept(&listener).await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn test_command_and_response_cross_the_link() {
        let (server, client) = pair().await;
        let (mut server_reader, server_writer) = server.into_split();
        let (mut client_reader, client_writer) = client.into_split();

        let frame = Frame::new(Opcode::Ping, Ticket::new(1), b"ping".to_vec());
        client_writer.write_frame(&frame).await.unwrap();
        let received = server_reader.read_frame().await.unwrap();
        assert_eq!(received.opcode(), Opcode::Ping);

        let response = Frame::new(Opcode::Response, received.ticket(), b"pong".to_vec());
        server_writer.write_frame(&response).await.unwrap();
        let response = client_reader.read_frame().await.unwrap();
        assert_eq!(response.ticket(), Ticket::new(1));
        assert_eq!(response.payload, b"pong");
    }

    #[tokio::test]
    async fn test_identity_then_frames() {
        let (mut server, client) = pair().await;
        client.writer().write_identity("nodeA").await.unwrap();
        client
            .writer()
            .write_frame(&Frame::unsolicited(Opcode::DiskStatus, vec![]))
            .await
            .unwrap();

        assert_eq!(server.reader().read_identity().await.unwrap(), "nodeA");
        let frame = server.reader().read_frame().await.unwrap();
        assert_eq!(frame.opcode(), Opcode::DiskStatus);
    }

    #[tokio::test]
    async fn test_identity_too_long() {
        let (mut server, client) = pair().await;
        let (_reader, writer) = client.into_split();
        let long = vec![b'x'; MAX_IDENTITY_LEN + 10];
        let mut guard = writer.write.lock().await;
        guard.write_all(&long).await.unwrap();
        drop(guard);
        assert!(matches!(
            server.reader().read_identity().await,
            Err(TransportError::InvalidIdentity { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_reported() {
        let (server, client) = pair().await;
        drop(client);
        let (mut reader, _writer) = server.into_split();
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
