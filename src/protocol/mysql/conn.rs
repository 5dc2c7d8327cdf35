//! Sequenced packet framing over a byte stream
//!
//! [`Connection`] owns one socket plus the protocol state that belongs to it:
//! the sequence counter, the negotiated capability flags and the collation.
//! Each side of a session (client-facing and backend-facing) gets its own
//! `Connection`, driven by exactly one task at a time.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::packets::{PacketHeader, DEFAULT_COLLATION_ID};
use crate::error::{ProxyError, Result};

const MAX_CHUNK: usize = PacketHeader::MAX_PAYLOAD_LENGTH as usize;

/// One side of a MySQL conversation.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    sequence: u8,
    capability: u32,
    collation: u8,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            capability: 0,
            collation: DEFAULT_COLLATION_ID,
        }
    }

    /// Sequence id the next frame (read or written) must carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    /// Replace the negotiated capability set.
    pub fn set_capabilities(&mut self, flags: u32) {
        self.capability = flags;
    }

    /// Add `flag` to the negotiated capability set.
    pub fn set_capability(&mut self, flag: u32) {
        self.capability |= flag;
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capability & flag != 0
    }

    pub fn collation(&self) -> u8 {
        self.collation
    }

    pub fn set_collation(&mut self, collation: u8) {
        self.collation = collation;
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Give up the socket, e.g. to wrap it in TLS or hand it to the relay.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Swap the underlying stream while keeping protocol state.
    pub fn map_stream<T>(self, f: impl FnOnce(S) -> T) -> Connection<T> {
        Connection {
            stream: f(self.stream),
            sequence: self.sequence,
            capability: self.capability,
            collation: self.collation,
        }
    }

    /// Async variant of [`map_stream`](Self::map_stream), used for the
    /// in-band TLS upgrade after an SSLRequest.
    pub async fn upgrade<T, E, F, Fut>(self, f: F) -> std::result::Result<Connection<T>, E>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        Ok(Connection {
            stream: f(self.stream).await?,
            sequence: self.sequence,
            capability: self.capability,
            collation: self.collation,
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Read one logical payload, reassembling frames of maximum size.
    ///
    /// Stream failures are [`ProxyError::BadConnection`]; a frame with an
    /// unexpected sequence id is [`ProxyError::Protocol`].
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut raw = [0u8; PacketHeader::SIZE];
            self.stream
                .read_exact(&mut raw)
                .await
                .map_err(|e| ProxyError::BadConnection(format!("read packet header: {}", e)))?;
            let header = PacketHeader::decode(raw);

            if header.sequence_id != self.sequence {
                return Err(ProxyError::Protocol(format!(
                    "invalid sequence {} != {}",
                    header.sequence_id, self.sequence
                )));
            }
            self.sequence = self.sequence.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| ProxyError::BadConnection(format!("read packet body: {}", e)))?;

            if len < MAX_CHUNK {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload, splitting it into frames.
    ///
    /// A payload that ends exactly on a frame boundary (including one of
    /// exactly `MAX_PAYLOAD_LENGTH` bytes) is followed by an empty frame.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_CHUNK);
            let (chunk, tail) = rest.split_at(chunk_len);

            let header = PacketHeader::new(chunk_len as u32, self.sequence).encode();
            self.stream
                .write_all(&header)
                .await
                .map_err(|e| ProxyError::BadConnection(format!("write packet header: {}", e)))?;
            self.stream
                .write_all(chunk)
                .await
                .map_err(|e| ProxyError::BadConnection(format!("write packet body: {}", e)))?;
            self.sequence = self.sequence.wrapping_add(1);

            rest = tail;
            if chunk_len < MAX_CHUNK {
                break;
            }
        }

        self.stream
            .flush()
            .await
            .map_err(|e| ProxyError::BadConnection(format!("flush: {}", e)))
    }

    /// Write several payloads in order, e.g. a result set.
    pub async fn write_packets(&mut self, payloads: &[Vec<u8>]) -> Result<()> {
        for payload in payloads {
            self.write_packet(payload).await?;
        }
        Ok(())
    }

    /// Whether the peer went away while no exchange was in progress.
    ///
    /// Never waits. Nothing may arrive between commands, so a readable
    /// byte counts as a broken connection too.
    pub async fn is_peer_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        timeout(Duration::ZERO, self.stream.read(&mut byte))
            .await
            .is_ok()
    }

    /// Shut down the write half; the socket closes when dropped.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
