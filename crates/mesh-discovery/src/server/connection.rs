// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed message transport over a byte stream.
//!
//! The same type serves both ends: the server wraps each accepted socket in
//! one, and clients (including the tests) wrap their outbound socket.

use super::protocol::{DiscoveryMessage, ProtocolError, FRAME_HEADER_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A connected peer.
pub struct ClientConnection<S = TcpStream> {
    stream: S,
    peer_addr: SocketAddr,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new client connection.
    pub fn new(stream: S, peer_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one framed message.
    ///
    /// Returns `Ok(None)` if the peer closed the stream between frames.
    pub async fn read_message(&mut self) -> Result<Option<DiscoveryMessage>, ConnectionError> {
        let mut len_buf = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = self.stream.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ConnectionError::Truncated {
                    expected: FRAME_HEADER_SIZE,
                    received: filled,
                });
            }
            filled += n;
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_message_size {
            return Err(ConnectionError::FrameTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);

        let mut received = 0;
        while received < len {
            let n = self.stream.read(&mut self.read_buffer[received..]).await?;
            if n == 0 {
                return Err(ConnectionError::Truncated {
                    expected: len,
                    received,
                });
            }
            received += n;
        }

        let msg = DiscoveryMessage::decode(&self.read_buffer)?;
        Ok(Some(msg))
    }

    /// Send one framed message.
    pub async fn send_message(&mut self, msg: &DiscoveryMessage) -> Result<(), ConnectionError> {
        let frame = msg.encode_frame();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Round trip: send `msg` and wait for the reply.
    pub async fn request(
        &mut self,
        msg: &DiscoveryMessage,
    ) -> Result<DiscoveryMessage, ConnectionError> {
        self.send_message(msg).await?;
        self.read_message()
            .await?
            .ok_or(ConnectionError::Truncated {
                expected: FRAME_HEADER_SIZE,
                received: 0,
            })
    }

    /// Shutdown the write half of the connection.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Connection error types.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Stream closed in the middle of a frame.
    #[error("Malformed frame: stream closed after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
