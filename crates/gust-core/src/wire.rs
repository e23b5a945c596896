//! gust wire format — every datagram on the network is one of these.
//!
//! These types ARE the protocol. A message is a 1-byte type tag followed
//! by big-endian fields; chunk lists carry a u8 count prefix and file
//! names a u8 length prefix. Datagrams never exceed 1029 bytes, which
//! leaves 1024 bytes of payload in a DataPacket after its 5-byte header.
//! Changing anything here is a breaking change for every peer on the LAN.

use bytes::Bytes;

use crate::hash::Sha1Hash;

// ── Constants ────────────────────────────────────────────────────────────────

/// UDP port used for all gust traffic. Every node binds the same port.
pub const DEFAULT_UDP_PORT: u16 = 61696;

/// Chunk size: 4 MiB. The atomic transfer and retry unit.
pub const CHUNK_SIZE: u32 = 1 << 22;

/// Largest datagram on the wire. 1024 data bytes + 5 bytes of header.
pub const MAX_DATAGRAM: usize = 1029;

/// DataPacket header overhead: tag byte + u32 offset.
pub const DATA_HEADER_BYTES: usize = 5;

/// Largest `data` field in one DataPacket.
pub const MAX_DATA_BYTES: usize = MAX_DATAGRAM - DATA_HEADER_BYTES;

/// First-packet preamble: 20-byte chunk hash + u32 chunk byte count.
pub const FIRST_PACKET_PREFIX: usize = 24;

/// Window capacity a receiver grants its peer when opening a transfer.
pub const RECEIVE_WINDOW_CAP: u16 = 1024;

// message type tags
pub const TAG_DISCOVER_HOST_REQUEST: u8 = 0;
pub const TAG_DISCOVER_HOST_RESPONSE: u8 = 1;
pub const TAG_LIST_FILES_REQUEST: u8 = 2;
pub const TAG_LIST_FILES_RESPONSE: u8 = 3;
pub const TAG_OPEN_CONNECTION: u8 = 4;
pub const TAG_DATA_PACKET: u8 = 5;
pub const TAG_DATA_PACKET_ACK: u8 = 6;

// ── Messages ─────────────────────────────────────────────────────────────────

/// One per-file entry in a ListFilesResponse. Names longer than 255 bytes
/// are truncated on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilesEntry {
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub chunks_downloaded: u32,
    pub hash: Sha1Hash,
    pub file_name: String,
}

/// The tagged union of everything that can appear in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broadcast to the LAN asking who has (parts of) a file. A blank
    /// hash asks everyone to announce themselves; an empty chunk list
    /// asks for all ranges the responder holds.
    DiscoverHostRequest {
        req_id: u16,
        hash: Sha1Hash,
        chunks: Vec<u16>,
    },
    /// A responder's address, port, and the chunk ranges it can serve.
    DiscoverHostResponse {
        req_id: u16,
        addr: [u8; 4],
        port: u16,
        chunks: Vec<u16>,
    },
    /// Ask one host to list its catalogue, or one file of it.
    ListFilesRequest { req_id: u16, hash: Sha1Hash },
    ListFilesResponse {
        req_id: u16,
        files: Vec<ListFilesEntry>,
    },
    /// Kick off an upload of one chunk toward the requester, who will
    /// accept at most `window_cap` unacked packets in flight.
    OpenConnection {
        hash: Sha1Hash,
        chunk: u16,
        window_cap: u16,
    },
    /// A slice of chunk data at `offset`. Offset 0 carries the 24-byte
    /// preamble (chunk hash + size) before the data; an empty `data` is
    /// the end-of-chunk terminator.
    DataPacket { offset: u32, data: Bytes },
    DataPacketAck { offset: u32 },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::DiscoverHostRequest { .. } => TAG_DISCOVER_HOST_REQUEST,
            Message::DiscoverHostResponse { .. } => TAG_DISCOVER_HOST_RESPONSE,
            Message::ListFilesRequest { .. } => TAG_LIST_FILES_REQUEST,
            Message::ListFilesResponse { .. } => TAG_LIST_FILES_RESPONSE,
            Message::OpenConnection { .. } => TAG_OPEN_CONNECTION,
            Message::DataPacket { .. } => TAG_DATA_PACKET,
            Message::DataPacketAck { .. } => TAG_DATA_PACKET_ACK,
        }
    }

    /// Encode for transmission.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.tag());
        match self {
            Message::DiscoverHostRequest {
                req_id,
                hash,
                chunks,
            } => {
                out.extend_from_slice(&req_id.to_be_bytes());
                out.extend_from_slice(hash.as_bytes());
                write_u16_list(&mut out, chunks);
            }
            Message::DiscoverHostResponse {
                req_id,
                addr,
                port,
                chunks,
            } => {
                out.extend_from_slice(&req_id.to_be_bytes());
                out.extend_from_slice(addr);
                out.extend_from_slice(&port.to_be_bytes());
                write_u16_list(&mut out, chunks);
            }
            Message::ListFilesRequest { req_id, hash } => {
                out.extend_from_slice(&req_id.to_be_bytes());
                out.extend_from_slice(hash.as_bytes());
            }
            Message::ListFilesResponse { req_id, files } => {
                out.extend_from_slice(&req_id.to_be_bytes());
                out.extend_from_slice(&(files.len() as u16).to_be_bytes());
                for entry in files {
                    out.extend_from_slice(&entry.size_bytes.to_be_bytes());
                    out.extend_from_slice(&entry.chunk_count.to_be_bytes());
                    out.extend_from_slice(&entry.chunk_size.to_be_bytes());
                    out.extend_from_slice(&entry.chunks_downloaded.to_be_bytes());
                    out.extend_from_slice(entry.hash.as_bytes());
                    write_name255(&mut out, &entry.file_name);
                }
            }
            Message::OpenConnection {
                hash,
                chunk,
                window_cap,
            } => {
                out.extend_from_slice(hash.as_bytes());
                out.extend_from_slice(&chunk.to_be_bytes());
                out.extend_from_slice(&window_cap.to_be_bytes());
            }
            Message::DataPacket { offset, data } => {
                debug_assert!(data.len() <= MAX_DATA_BYTES);
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(data);
            }
            Message::DataPacketAck { offset } => {
                out.extend_from_slice(&offset.to_be_bytes());
            }
        }
        out
    }

    /// Decode a datagram. Truncated or unknown frames yield `BadFrame`
    /// carrying the offending tag.
    pub fn parse(data: &[u8]) -> Result<Message, WireError> {
        let Some((&tag, body)) = data.split_first() else {
            return Err(WireError::Empty);
        };
        Self::parse_body(tag, body).ok_or(WireError::BadFrame(tag))
    }

    fn parse_body(tag: u8, body: &[u8]) -> Option<Message> {
        let mut r = ByteReader::new(body);
        let parsed = match tag {
            TAG_DISCOVER_HOST_REQUEST => {
                let req_id = r.read_u16()?;
                let hash = r.read_hash()?;
                let chunks = r.read_u16_list()?;
                Message::DiscoverHostRequest {
                    req_id,
                    hash,
                    chunks,
                }
            }
            TAG_DISCOVER_HOST_RESPONSE => {
                let req_id = r.read_u16()?;
                let addr_bytes = r.read_bytes(4)?;
                let addr = [addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3]];
                let port = r.read_u16()?;
                let chunks = r.read_u16_list()?;
                Message::DiscoverHostResponse {
                    req_id,
                    addr,
                    port,
                    chunks,
                }
            }
            TAG_LIST_FILES_REQUEST => {
                let req_id = r.read_u16()?;
                let hash = r.read_hash()?;
                Message::ListFilesRequest { req_id, hash }
            }
            TAG_LIST_FILES_RESPONSE => {
                let req_id = r.read_u16()?;
                let count = r.read_u16()?;
                let mut files = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    files.push(ListFilesEntry {
                        size_bytes: r.read_u64()?,
                        chunk_count: r.read_u32()?,
                        chunk_size: r.read_u32()?,
                        chunks_downloaded: r.read_u32()?,
                        hash: r.read_hash()?,
                        file_name: r.read_name255()?,
                    });
                }
                Message::ListFilesResponse { req_id, files }
            }
            TAG_OPEN_CONNECTION => {
                let hash = r.read_hash()?;
                let chunk = r.read_u16()?;
                let window_cap = r.read_u16()?;
                Message::OpenConnection {
                    hash,
                    chunk,
                    window_cap,
                }
            }
            TAG_DATA_PACKET => {
                let offset = r.read_u32()?;
                Message::DataPacket {
                    offset,
                    data: Bytes::copy_from_slice(r.rest()),
                }
            }
            TAG_DATA_PACKET_ACK => {
                let offset = r.read_u32()?;
                Message::DataPacketAck { offset }
            }
            _ => return None,
        };
        Some(parsed)
    }
}

fn write_u16_list(out: &mut Vec<u8>, items: &[u16]) {
    debug_assert!(items.len() <= 255);
    out.push(items.len() as u8);
    for item in items {
        out.extend_from_slice(&item.to_be_bytes());
    }
}

// u8 length prefix, then up to 255 bytes of the name. Truncation lands on
// a char boundary so the receiving side always parses valid UTF-8.
fn write_name255(out: &mut Vec<u8>, name: &str) {
    let mut end = name.len().min(255);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    out.push(end as u8);
    out.extend_from_slice(&name.as_bytes()[..end]);
}

// ── Byte reader ──────────────────────────────────────────────────────────────

// Cursor over a message body. Every accessor bounds-checks so a hostile
// or truncated datagram surfaces as a parse error, never a panic.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    fn read_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(count)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn read_u8(&mut self) -> Option<u8> {
        Some(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    fn read_hash(&mut self) -> Option<Sha1Hash> {
        Sha1Hash::from_slice(self.read_bytes(20)?)
    }

    fn read_u16_list(&mut self) -> Option<Vec<u16>> {
        let count = usize::from(self.read_u8()?);
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_u16()?);
        }
        Some(items)
    }

    fn read_name255(&mut self) -> Option<String> {
        let len = usize::from(self.read_u8()?);
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message of unknown or malformed type discarded: {0}")]
    BadFrame(u8),
    #[error("empty datagram")]
    Empty,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.serialize();
        let recovered = Message::parse(&bytes).unwrap();
        assert_eq!(recovered, msg);
    }

    #[test]
    fn discover_host_request_round_trip() {
        round_trip(Message::DiscoverHostRequest {
            req_id: 123,
            hash: Sha1Hash::from_hex("f10e2821bbbea527ea02200352313bc059445190").unwrap(),
            chunks: vec![4, 5, 60123],
        });
    }

    #[test]
    fn discover_host_request_empty_chunks() {
        round_trip(Message::DiscoverHostRequest {
            req_id: 0,
            hash: Sha1Hash::blank(),
            chunks: vec![],
        });
    }

    #[test]
    fn discover_host_response_round_trip() {
        round_trip(Message::DiscoverHostResponse {
            req_id: 45678,
            addr: [192, 168, 86, 34],
            port: 61690,
            chunks: vec![0, 2],
        });
    }

    #[test]
    fn list_files_request_round_trip() {
        round_trip(Message::ListFilesRequest {
            req_id: 9,
            hash: Sha1Hash::of_bytes(b"some file"),
        });
    }

    #[test]
    fn list_files_response_round_trip() {
        round_trip(Message::ListFilesResponse {
            req_id: 7,
            files: vec![
                ListFilesEntry {
                    size_bytes: 10 * 1024 * 1024,
                    chunk_count: 3,
                    chunk_size: CHUNK_SIZE,
                    chunks_downloaded: 3,
                    hash: Sha1Hash::of_bytes(b"a"),
                    file_name: "a.bin".to_string(),
                },
                ListFilesEntry {
                    size_bytes: 1,
                    chunk_count: 1,
                    chunk_size: CHUNK_SIZE,
                    chunks_downloaded: 0,
                    hash: Sha1Hash::of_bytes(b"b"),
                    file_name: "b.mkv".to_string(),
                },
            ],
        });
    }

    #[test]
    fn list_files_response_empty_round_trip() {
        round_trip(Message::ListFilesResponse {
            req_id: 1,
            files: vec![],
        });
    }

    #[test]
    fn open_connection_round_trip() {
        round_trip(Message::OpenConnection {
            hash: Sha1Hash::of_bytes(b"wanted"),
            chunk: 2,
            window_cap: RECEIVE_WINDOW_CAP,
        });
    }

    #[test]
    fn data_packet_round_trip() {
        round_trip(Message::DataPacket {
            offset: 4096,
            data: Bytes::from_static(b"payload bytes"),
        });
        // terminator: empty data
        round_trip(Message::DataPacket {
            offset: CHUNK_SIZE,
            data: Bytes::new(),
        });
    }

    #[test]
    fn data_packet_ack_round_trip() {
        round_trip(Message::DataPacketAck { offset: 0 });
        round_trip(Message::DataPacketAck { offset: u32::MAX });
    }

    #[test]
    fn data_packet_fits_datagram_budget() {
        let msg = Message::DataPacket {
            offset: 0,
            data: Bytes::from(vec![0xAB; MAX_DATA_BYTES]),
        };
        assert_eq!(msg.serialize().len(), MAX_DATAGRAM);
    }

    #[test]
    fn unknown_tag_is_bad_frame() {
        assert_eq!(Message::parse(&[9, 0, 0]), Err(WireError::BadFrame(9)));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let mut bytes = Message::DiscoverHostRequest {
            req_id: 3,
            hash: Sha1Hash::of_bytes(b"x"),
            chunks: vec![1, 2],
        }
        .serialize();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            Message::parse(&bytes),
            Err(WireError::BadFrame(TAG_DISCOVER_HOST_REQUEST))
        );

        assert_eq!(Message::parse(&[]), Err(WireError::Empty));
        assert_eq!(
            Message::parse(&[TAG_DATA_PACKET_ACK, 0, 0]),
            Err(WireError::BadFrame(TAG_DATA_PACKET_ACK))
        );
    }

    #[test]
    fn long_file_names_truncate_on_the_wire() {
        let msg = Message::ListFilesResponse {
            req_id: 2,
            files: vec![ListFilesEntry {
                size_bytes: 1,
                chunk_count: 1,
                chunk_size: CHUNK_SIZE,
                chunks_downloaded: 1,
                hash: Sha1Hash::of_bytes(b"long"),
                file_name: "x".repeat(300),
            }],
        };
        let parsed = Message::parse(&msg.serialize()).unwrap();
        match parsed {
            Message::ListFilesResponse { files, .. } => {
                assert_eq!(files[0].file_name.len(), 255);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
