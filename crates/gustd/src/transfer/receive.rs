//! Receiver side of one chunk transfer.
//!
//! The receiver dials the serving peer from a fresh ephemeral socket,
//! sends OpenConnection, and reassembles DataPackets by offset until the
//! empty terminator arrives. The buffer is verified against the hash
//! advertised in the first packet before anything touches disk; a failed
//! chunk leaves no partial state and its progress bit unset.
//!
//! States: dialing → waiting-for-metadata → streaming → verifying →
//! done/failed. Every read carries a 5-second deadline; silence means
//! the transfer is abandoned and the orchestrator may retry elsewhere.

use std::net::SocketAddrV4;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use gust_catalogue::{Catalogue, CatalogueError};
use gust_core::wire::{Message, FIRST_PACKET_PREFIX, MAX_DATAGRAM, RECEIVE_WINDOW_CAP};
use gust_core::Sha1Hash;

/// How long to wait for any single datagram before giving up.
const READ_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no data from peer within {}s", READ_DEADLINE.as_secs())]
    Timeout,
    #[error("chunk verification failed: advertised {advertised}, computed {computed}")]
    HashMismatch {
        advertised: Sha1Hash,
        computed: Sha1Hash,
    },
    #[error("peer violated the transfer protocol: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Reassembly state for one chunk. The buffer is allocated when the
// offset-0 packet announces the chunk size.
struct Reassembly {
    advertised: Option<Sha1Hash>,
    buffer: Option<Vec<u8>>,
    bytes_received: usize,
    // packets that arrived before the metadata packet
    pending: Vec<(u32, Bytes)>,
}

impl Reassembly {
    fn new() -> Self {
        Reassembly {
            advertised: None,
            buffer: None,
            bytes_received: 0,
            pending: Vec::new(),
        }
    }

    // Handle the offset-0 packet: 20-byte hash, u32 size, leading data.
    fn accept_metadata(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if data.len() < FIRST_PACKET_PREFIX {
            return Err(TransferError::Protocol("first packet shorter than its preamble"));
        }
        let advertised = Sha1Hash::from_slice(&data[..20]).unwrap();
        let size = u32::from_be_bytes(data[20..24].try_into().unwrap()) as usize;
        let body = &data[FIRST_PACKET_PREFIX..];
        if body.len() > size {
            return Err(TransferError::Protocol("first packet overflows the chunk"));
        }

        let mut buffer = vec![0u8; size];
        buffer[..body.len()].copy_from_slice(body);
        self.bytes_received += body.len();
        self.advertised = Some(advertised);
        self.buffer = Some(buffer);

        // apply anything that raced ahead of the metadata
        for (offset, data) in std::mem::take(&mut self.pending) {
            self.accept_data(offset, &data)?;
        }
        Ok(())
    }

    fn accept_data(&mut self, offset: u32, data: &[u8]) -> Result<(), TransferError> {
        let Some(buffer) = self.buffer.as_mut() else {
            self.pending.push((offset, Bytes::copy_from_slice(data)));
            return Ok(());
        };
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or(TransferError::Protocol("packet offset overflows"))?;
        if end > buffer.len() {
            return Err(TransferError::Protocol("packet past the end of the chunk"));
        }
        buffer[start..end].copy_from_slice(data);
        self.bytes_received += data.len();
        Ok(())
    }

    // The terminator arrived: verify the buffer against the advertised hash.
    fn finish(self) -> Result<Vec<u8>, TransferError> {
        let (Some(advertised), Some(buffer)) = (self.advertised, self.buffer) else {
            return Err(TransferError::Protocol("terminator before metadata"));
        };
        let computed = Sha1Hash::of_bytes(&buffer);
        if computed != advertised {
            return Err(TransferError::HashMismatch {
                advertised,
                computed,
            });
        }
        Ok(buffer)
    }
}

/// Download one chunk of `hash` from `peer` and persist it through the
/// catalogue. On any failure the progress bit stays unset and nothing is
/// written to disk.
pub async fn fetch_chunk(
    catalogue: &Catalogue,
    peer: SocketAddrV4,
    hash: Sha1Hash,
    chunk: u16,
) -> Result<(), TransferError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(peer).await?;

    let open = Message::OpenConnection {
        hash,
        chunk,
        window_cap: RECEIVE_WINDOW_CAP,
    };
    socket.send(&open.serialize()).await?;
    tracing::debug!(%peer, %hash, chunk, "chunk download dialed");

    let mut state = Reassembly::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let n = match timeout(READ_DEADLINE, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    %peer,
                    %hash,
                    chunk,
                    bytes_received = state.bytes_received,
                    "chunk download timed out"
                );
                return Err(TransferError::Timeout);
            }
        };

        let (offset, data) = match Message::parse(&buf[..n]) {
            Ok(Message::DataPacket { offset, data }) => (offset, data),
            Ok(other) => {
                tracing::trace!(%peer, tag = other.tag(), "unexpected message on transfer socket");
                continue;
            }
            Err(e) => {
                tracing::trace!(%peer, error = %e, "bad frame on transfer socket");
                continue;
            }
        };

        if offset == 0 {
            state.accept_metadata(&data)?;
        } else if !data.is_empty() {
            state.accept_data(offset, &data)?;
        } else {
            // empty data is the terminator: verify and persist before
            // the final ack, so an acked chunk is always durable
            let buffer = state.finish()?;
            catalogue.save_chunk(&hash, chunk, &buffer).await?;
            let ack = Message::DataPacketAck { offset };
            socket.send(&ack.serialize()).await?;
            tracing::info!(
                %peer,
                %hash,
                chunk,
                bytes = buffer.len(),
                "chunk downloaded and verified"
            );
            return Ok(());
        }

        let ack = Message::DataPacketAck { offset };
        socket.send(&ack.serialize()).await?;
    }
}
