//! Sender side of one chunk transfer.
//!
//! One sender exists per (peer IP, peer port) endpoint — the uploader
//! correlates by connection, not by content. The first packet carries a
//! 24-byte preamble (chunk hash + byte count) so the receiver can size
//! its buffer; every later packet is raw data at an offset. The window
//! invariant holds throughout: 0 ≤ window_size ≤ window_cap, and nothing
//! is sent while the window is at capacity. EOF produces a single
//! empty-data terminator packet and tears the sender down.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use gust_core::wire::{Message, FIRST_PACKET_PREFIX, MAX_DATA_BYTES};
use gust_core::ChunkReader;

/// Events the message server feeds a running sender.
#[derive(Debug)]
pub enum SenderEvent {
    /// The peer acknowledged a packet; the window opens by one.
    Ack(u32),
    /// A fresh OpenConnection arrived for this endpoint — rewind and
    /// start the chunk over (idempotent open).
    Restart,
}

pub struct SenderTransfer {
    reader: ChunkReader,
    window_size: u16,
    window_cap: u16,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl SenderTransfer {
    pub fn new(
        reader: ChunkReader,
        window_cap: u16,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Self {
        SenderTransfer {
            reader,
            window_size: 0,
            window_cap: window_cap.max(1),
            socket,
            peer,
        }
    }

    /// Rewind the reader and send the first packet:
    /// `offset = 0, data = hash ‖ size ‖ first bytes`.
    pub async fn kickstart(&mut self) -> Result<()> {
        self.reader.reset();
        self.window_size = 0;

        let mut data = Vec::with_capacity(MAX_DATA_BYTES);
        data.extend_from_slice(self.reader.hash().as_bytes());
        data.extend_from_slice(&self.reader.size().to_be_bytes());

        let mut body = [0u8; MAX_DATA_BYTES - FIRST_PACKET_PREFIX];
        let (n, _) = self.reader.read(&mut body)?;
        data.extend_from_slice(&body[..n]);

        let packet = Message::DataPacket {
            offset: 0,
            data: Bytes::from(data),
        };
        self.socket
            .send_to(&packet.serialize(), self.peer)
            .await
            .context("failed to send first packet")?;
        self.window_size += 1;

        tracing::debug!(
            peer = %self.peer,
            chunk_hash = %self.reader.hash(),
            chunk_bytes = self.reader.size(),
            "upload kickstarted"
        );
        Ok(())
    }

    // One ack arrived: shrink the window, then refill it from the
    // reader. Returns true once the terminator has been sent.
    async fn pump(&mut self) -> Result<bool> {
        self.window_size = self.window_size.saturating_sub(1);

        let mut buf = [0u8; MAX_DATA_BYTES];
        while self.window_size < self.window_cap {
            let (n, offset) = self.reader.read(&mut buf)?;

            let packet = Message::DataPacket {
                offset,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            self.socket
                .send_to(&packet.serialize(), self.peer)
                .await
                .context("failed to send data packet")?;
            self.window_size += 1;

            if n == 0 {
                // empty data is the terminator
                tracing::debug!(peer = %self.peer, "upload complete, terminator sent");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drive the sender until the chunk is fully sent, the peer goes
    /// quiet forever (the server drops the event channel), or a cancel
    /// signal arrives.
    pub async fn run(mut self, mut events: mpsc::Receiver<SenderEvent>, mut cancel: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SenderEvent::Ack(offset)) => {
                        tracing::trace!(peer = %self.peer, offset, "ack received");
                        match self.pump().await {
                            Ok(false) => {}
                            Ok(true) => break,
                            Err(e) => {
                                tracing::warn!(peer = %self.peer, error = %e, "upload failed");
                                break;
                            }
                        }
                    }
                    Some(SenderEvent::Restart) => {
                        if let Err(e) = self.kickstart().await {
                            tracing::warn!(peer = %self.peer, error = %e, "upload restart failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.recv() => {
                    tracing::debug!(peer = %self.peer, "upload cancelled");
                    break;
                }
            }
        }
    }
}
