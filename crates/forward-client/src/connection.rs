// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream connection interface and the framed TCP implementation.
//!
//! A session drives one connection from two concurrent loops (a chunk
//! sender and an acknowledgement reader), so the interface is split at
//! exactly that seam: [`Connector::connect`] yields a [`Connection`]
//! holding one [`ChunkSender`] and one [`AckReader`] half. Dropping both
//! halves closes the underlying socket.
//!
//! # Wire format
//!
//! Every frame starts with a fixed preamble, followed by a length-prefixed
//! body:
//!
//! ```text
//! +-------+-------+-------+--------------------+----------------------+
//! | magic | ver   | type  | body_len (u32, BE) | body                 |
//! | 0x4C  | 0x01  |       |                    |                      |
//! +-------+-------+-------+--------------------+----------------------+
//! ```
//!
//! - chunk (`0x01`): body is a JSON header `{"id","size"}`; `size` raw
//!   payload bytes follow immediately after the body.
//! - ping (`0x02`): empty body, no response expected.
//! - ack (`0x03`, collector → agent): body is JSON `{"ack":"<chunk id>"}`;
//!   an empty ID acknowledges the oldest unacknowledged chunk (FIFO).
//!
//! Encryption and authentication are delegated to the transport; a TLS
//! connector would implement the same traits.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use hybrid_buffer::Chunk;

/// Magic byte, 'L'. Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = 0x4C;

/// Wire format version. Bump when the preamble layout changes.
pub const VERSION: u8 = 0x01;

/// Frame type: chunk header + raw payload, agent → collector.
pub const FRAME_CHUNK: u8 = 0x01;
/// Frame type: keepalive, agent → collector, no body.
pub const FRAME_PING: u8 = 0x02;
/// Frame type: acknowledgement, collector → agent.
pub const FRAME_ACK: u8 = 0x03;

/// Ack frames are tiny; anything bigger means the stream is desynchronized.
const MAX_ACK_BODY_LEN: u32 = 64 * 1024;

/// Network and protocol failures, classified for the reconnect policy.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    /// The stream no longer parses; the connection must be abandoned.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// JSON header preceding a chunk's raw payload bytes.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkFrameHeader {
    id: String,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckFrame {
    ack: String,
}

/// Write half of an upstream connection.
#[async_trait]
pub trait ChunkSender: Send {
    /// Sends one chunk, bounded by `limit`. The payload must be loaded.
    async fn send_chunk(&mut self, chunk: &Chunk, limit: Duration) -> Result<(), NetError>;

    /// Sends a no-op keepalive, bounded by `limit`.
    async fn send_ping(&mut self, limit: Duration) -> Result<(), NetError>;
}

/// Read half of an upstream connection.
#[async_trait]
pub trait AckReader: Send {
    /// Reads the next acknowledgement, bounded by `limit`. `Ok(None)`
    /// is an empty (FIFO) acknowledgement.
    async fn read_ack(&mut self, limit: Duration) -> Result<Option<String>, NetError>;
}

/// One opened connection, split for the session's two loops.
pub struct Connection {
    pub remote: String,
    pub sender: Box<dyn ChunkSender>,
    pub reader: Box<dyn AckReader>,
}

/// Opens connections to one upstream. Implemented per wire transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, NetError>;
}

/// Plain-TCP connector speaking the framed protocol above.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        TcpConnector {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Connection, NetError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetError::Timeout(self.connect_timeout))??;
        // Chunks are already batched; latency beats Nagle coalescing here.
        let _ = stream.set_nodelay(true);
        let remote = stream
            .peer_addr()
            .map_or_else(|_| self.addr.clone(), |a| a.to_string());
        debug!(remote = %remote, "connected");
        let (read, write) = stream.into_split();
        Ok(Connection {
            remote,
            sender: Box::new(TcpChunkSender { write }),
            reader: Box::new(TcpAckReader { read }),
        })
    }
}

struct TcpChunkSender {
    write: OwnedWriteHalf,
}

impl TcpChunkSender {
    async fn write_frame(
        &mut self,
        frame_type: u8,
        body: &[u8],
        payload: Option<&[u8]>,
        limit: Duration,
    ) -> Result<(), NetError> {
        let mut frame = Vec::with_capacity(7 + body.len() + payload.map_or(0, <[u8]>::len));
        frame.push(MAGIC);
        frame.push(VERSION);
        frame.push(frame_type);
        let body_len = u32::try_from(body.len())
            .map_err(|_| NetError::Protocol("frame body exceeds 4 GiB".into()))?;
        frame.extend_from_slice(&body_len.to_be_bytes());
        frame.extend_from_slice(body);
        if let Some(payload) = payload {
            frame.extend_from_slice(payload);
        }

        timeout(limit, async {
            self.write.write_all(&frame).await?;
            self.write.flush().await
        })
        .await
        .map_err(|_| NetError::Timeout(limit))??;
        Ok(())
    }
}

#[async_trait]
impl ChunkSender for TcpChunkSender {
    async fn send_chunk(&mut self, chunk: &Chunk, limit: Duration) -> Result<(), NetError> {
        let payload = chunk
            .payload()
            .ok_or_else(|| NetError::Protocol("chunk payload not loaded".into()))?;
        let header = serde_json::to_vec(&ChunkFrameHeader {
            id: chunk.id().as_str().to_string(),
            size: payload.len() as u64,
        })
        .map_err(|e| NetError::Protocol(format!("cannot encode chunk header: {e}")))?;
        self.write_frame(FRAME_CHUNK, &header, Some(payload), limit)
            .await
    }

    async fn send_ping(&mut self, limit: Duration) -> Result<(), NetError> {
        self.write_frame(FRAME_PING, &[], None, limit).await
    }
}

struct TcpAckReader {
    read: OwnedReadHalf,
}

#[async_trait]
impl AckReader for TcpAckReader {
    async fn read_ack(&mut self, limit: Duration) -> Result<Option<String>, NetError> {
        let frame = timeout(limit, async {
            let mut preamble = [0u8; 7];
            self.read.read_exact(&mut preamble).await?;
            if preamble[0] != MAGIC || preamble[1] != VERSION {
                return Err(NetError::Protocol(format!(
                    "bad frame preamble {:02x}{:02x}",
                    preamble[0], preamble[1]
                )));
            }
            if preamble[2] != FRAME_ACK {
                return Err(NetError::Protocol(format!(
                    "unexpected frame type {:#04x}",
                    preamble[2]
                )));
            }
            let body_len = u32::from_be_bytes([preamble[3], preamble[4], preamble[5], preamble[6]]);
            if body_len > MAX_ACK_BODY_LEN {
                return Err(NetError::Protocol(format!(
                    "oversized ack frame ({body_len} bytes)"
                )));
            }
            let mut body = vec![0u8; body_len as usize];
            self.read.read_exact(&mut body).await?;
            Ok(body)
        })
        .await
        .map_err(|_| NetError::Timeout(limit))?;

        let body = match frame {
            Ok(body) => body,
            Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NetError::Closed)
            }
            Err(e) => return Err(e),
        };

        let ack: AckFrame = serde_json::from_slice(&body)
            .map_err(|e| NetError::Protocol(format!("cannot decode ack frame: {e}")))?;
        if ack.ack.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ack.ack))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_buffer::ChunkId;
    use tokio::net::TcpListener;

    async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.expect("read");
        buf
    }

    #[tokio::test]
    async fn chunk_frames_carry_header_then_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let (conn, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut conn = conn.expect("connect");
        let (mut server, _) = accepted.expect("accept");

        let chunk = Chunk::new(
            ChunkId::new("1722800000.000000000.000042"),
            b"payload bytes".to_vec(),
        );
        conn.sender
            .send_chunk(&chunk, Duration::from_secs(1))
            .await
            .expect("send");

        let preamble = read_exact(&mut server, 7).await;
        assert_eq!(preamble[0], MAGIC);
        assert_eq!(preamble[1], VERSION);
        assert_eq!(preamble[2], FRAME_CHUNK);
        let body_len =
            u32::from_be_bytes([preamble[3], preamble[4], preamble[5], preamble[6]]) as usize;

        let header: ChunkFrameHeader =
            serde_json::from_slice(&read_exact(&mut server, body_len).await).expect("header");
        assert_eq!(header.id, "1722800000.000000000.000042");
        assert_eq!(header.size, 13);
        assert_eq!(read_exact(&mut server, 13).await, b"payload bytes");
    }

    #[tokio::test]
    async fn acks_decode_specific_and_fifo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let (conn, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut conn = conn.expect("connect");
        let (mut server, _) = accepted.expect("accept");

        for ack in ["1722800000.000000000.000001", ""] {
            let body = serde_json::to_vec(&AckFrame { ack: ack.into() }).expect("encode");
            let mut frame = vec![MAGIC, VERSION, FRAME_ACK];
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&body);
            server.write_all(&frame).await.expect("write");
        }

        let first = conn
            .reader
            .read_ack(Duration::from_secs(1))
            .await
            .expect("first ack");
        assert_eq!(first.as_deref(), Some("1722800000.000000000.000001"));

        let second = conn
            .reader
            .read_ack(Duration::from_secs(1))
            .await
            .expect("second ack");
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn garbage_on_the_wire_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let (conn, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut conn = conn.expect("connect");
        let (mut server, _) = accepted.expect("accept");

        server.write_all(b"not a frame").await.expect("write");
        let err = conn
            .reader
            .read_ack(Duration::from_secs(1))
            .await
            .expect_err("protocol error");
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[tokio::test]
    async fn peer_close_maps_to_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let (conn, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut conn = conn.expect("connect");
        drop(accepted.expect("accept"));

        let err = conn
            .reader
            .read_ack(Duration::from_secs(1))
            .await
            .expect_err("closed");
        assert!(matches!(err, NetError::Closed));
    }

    #[tokio::test]
    async fn read_ack_times_out_on_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let (conn, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut conn = conn.expect("connect");
        let _server = accepted.expect("accept");

        let err = conn
            .reader
            .read_ack(Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert!(matches!(err, NetError::Timeout(_)));
    }
}
