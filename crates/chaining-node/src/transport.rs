//! Framed TCP connections.
//!
//! One [`Connection`] per peer pair. Every message is a single frame
//! (`u32` length, version byte, CBOR body). Reads go through a
//! [`FrameDecoder`]; byte counters feed the run report.
//!
//! # Invariants
//!
//! - A stream that ends with no buffered bytes is a clean close
//! - A stream that ends inside a frame, prefix included, is an error

use std::net::SocketAddr;

use chaining_core::{ChainError, Environment, RetryPolicy};
use chaining_proto::{FrameDecoder, encode_frame};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::NodeError;

/// Size of a single socket read.
const READ_CHUNK: usize = 64 * 1024;

/// A framed, byte-counted TCP connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> Result<Self, NodeError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer,
            decoder: FrameDecoder::new(),
            read_buf: vec![0; READ_CHUNK],
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Encode and send one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), NodeError> {
        let frame = encode_frame(message)?;
        self.send_frame(&frame).await
    }

    /// Send an already encoded frame.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), NodeError> {
        self.stream.write_all(frame).await?;
        self.bytes_sent += frame.len() as u64;
        Ok(())
    }

    /// Receive one message. A closed connection is an error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, NodeError> {
        self.recv_optional()
            .await?
            .ok_or_else(|| NodeError::Transport(format!("{} closed the connection", self.peer)))
    }

    /// Receive one message, or `None` if the peer closed cleanly between
    /// frames.
    pub async fn recv_optional<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NodeError> {
        loop {
            if let Some(message) = self.decoder.next_frame()? {
                return Ok(Some(message));
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return match self.decoder.buffered() {
                    0 => Ok(None),
                    partial => Err(NodeError::Transport(format!(
                        "{} closed the connection inside a frame ({partial} bytes buffered)",
                        self.peer
                    ))),
                };
            }
            self.bytes_received += n as u64;
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    /// Bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes read so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) -> Result<(), NodeError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Connect to `address`, retrying with a fixed pause.
///
/// Only connection establishment is retried; a connection that fails later
/// ends the run.
pub async fn connect_with_retry<E: Environment>(
    env: &E,
    address: &str,
    policy: RetryPolicy,
) -> Result<Connection, NodeError> {
    let tries = policy.max_tries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=tries {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                tracing::debug!(address, attempt, "connected");
                return Connection::new(stream);
            },
            Err(e) => {
                tracing::info!(address, attempt, tries, error = %e, "waiting for connection");
                last_error = e.to_string();
                if attempt < tries {
                    env.sleep(policy.delay()).await;
                }
            },
        }
    }

    Err(ChainError::Connection { peer: address.to_string(), reason: last_error }.into())
}
