//! The message server: one UDP socket for everything.
//!
//! Every datagram a node sends or receives goes through this socket —
//! discovery broadcasts, catalogue listings, upload kickoffs, and the
//! acks that drive running uploads. Incoming datagrams are parsed and
//! dispatched concurrently; responses to our own outbound requests are
//! correlated back to their callers through a (request id, response tag)
//! waiter map. Uploads are keyed by the remote endpoint (IP and port),
//! downloads by content and remote IP — an uploader correlates by
//! connection, a downloader by file.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use gust_catalogue::{Catalogue, RecordSnapshot};
use gust_core::wire::{self, ListFilesEntry, Message};
use gust_core::{ChunkRange, Sha1Hash};

use crate::transfer::{SenderEvent, SenderTransfer};

/// How long discovery broadcasts collect responses.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// How long to wait for a single host's file listing.
pub const LIST_FILES_DEADLINE: Duration = Duration::from_secs(2);

// A DiscoverHostResponse chunk list must fit the wire's u8 count prefix.
const MAX_WIRE_RANGES: usize = 127;

/// One peer that answered a discovery broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
    pub addr: [u8; 4],
    pub port: u16,
    /// Flat [start, end, ...] pairs of the chunks the host can serve.
    pub chunks: Vec<u16>,
}

impl DiscoveredHost {
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port)
    }
}

struct UploadHandle {
    stamp: u64,
    events: mpsc::Sender<SenderEvent>,
    cancel: mpsc::Sender<()>,
}

pub struct Server {
    socket: Arc<UdpSocket>,
    port: u16,
    lan_ip: Ipv4Addr,
    catalogue: Arc<Catalogue>,
    next_req_id: AtomicU16,
    next_upload_stamp: AtomicU64,
    /// (request id, expected response tag) → the caller's channel.
    waiters: DashMap<(u16, u8), mpsc::Sender<Message>>,
    /// Live uploads keyed by remote endpoint.
    uploads: Arc<DashMap<(Ipv4Addr, u16), UploadHandle>>,
    /// Chunk fetches in flight, keyed by content and remote IP.
    chunk_fetches: DashMap<(Sha1Hash, Ipv4Addr), ()>,
    /// Files with a running download loop.
    active_downloads: DashMap<Sha1Hash, ()>,
}

impl Server {
    /// Bind the shared socket on all interfaces and learn our LAN IPv4.
    pub fn bind(port: u16, catalogue: Arc<Catalogue>) -> Result<Arc<Self>> {
        let socket = make_broadcast_socket(port).context("failed to create server socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to register socket with tokio")?;
        // port 0 asks the OS to pick; record what we actually got
        let port = socket.local_addr().context("local_addr failed")?.port();

        let lan_ip = lan_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        if lan_ip.is_unspecified() {
            tracing::warn!("could not determine LAN IPv4; discovery replies will carry 0.0.0.0");
        }

        Ok(Arc::new(Server {
            socket: Arc::new(socket),
            port,
            lan_ip,
            catalogue,
            next_req_id: AtomicU16::new(0),
            next_upload_stamp: AtomicU64::new(0),
            waiters: DashMap::new(),
            uploads: Arc::new(DashMap::new()),
            chunk_fetches: DashMap::new(),
            active_downloads: DashMap::new(),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn lan_ip(&self) -> Ipv4Addr {
        self.lan_ip
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    /// The inbound read loop. Runs forever; each datagram is handled on
    /// its own task so a slow catalogue operation never blocks the socket.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; wire::MAX_DATAGRAM];
        tracing::info!(port = self.port, lan_ip = %self.lan_ip, "message server listening");

        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("recv_from failed")?;

            let message = match Message::parse(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "discarding datagram");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_message(message, from).await {
                    tracing::warn!(%from, error = %e, "message handling failed");
                }
            });
        }
    }

    async fn handle_message(&self, message: Message, from: SocketAddr) -> Result<()> {
        let SocketAddr::V4(peer) = from else {
            tracing::debug!(%from, "ignoring non-IPv4 peer");
            return Ok(());
        };

        match message {
            Message::DiscoverHostRequest {
                req_id,
                hash,
                chunks,
            } => self.respond_to_discover(req_id, hash, &chunks, peer).await,
            Message::ListFilesRequest { req_id, hash } => {
                self.respond_to_list_files(req_id, hash, peer).await
            }
            Message::OpenConnection {
                hash,
                chunk,
                window_cap,
            } => self.start_upload(hash, chunk, window_cap, peer).await,
            Message::DataPacketAck { offset } => {
                self.continue_upload(offset, peer);
                Ok(())
            }
            response @ (Message::DiscoverHostResponse { .. } | Message::ListFilesResponse { .. }) => {
                self.deliver_response(response);
                Ok(())
            }
            Message::DataPacket { .. } => {
                // data packets only ever arrive on per-transfer sockets
                tracing::trace!(%peer, "stray data packet on the main socket");
                Ok(())
            }
        }
    }

    // ── Responder side ───────────────────────────────────────────────────────

    async fn respond_to_discover(
        &self,
        req_id: u16,
        hash: Sha1Hash,
        chunks: &[u16],
        peer: SocketAddrV4,
    ) -> Result<()> {
        let mut reply_chunks = Vec::new();
        if !hash.is_blank() {
            if let Ok(snapshot) = self.catalogue.contains(&hash).await {
                let mut ranges = if chunks.is_empty() {
                    snapshot.progress.ranges()
                } else {
                    snapshot.progress.overlap(&ChunkRange::from_flat(chunks))
                };
                ranges.truncate(MAX_WIRE_RANGES);
                reply_chunks = ChunkRange::flatten(&ranges);
            }
        }

        let response = Message::DiscoverHostResponse {
            req_id,
            addr: self.lan_ip.octets(),
            port: self.port,
            chunks: reply_chunks,
        };
        self.socket
            .send_to(&response.serialize(), peer)
            .await
            .context("failed to send discover response")?;
        Ok(())
    }

    async fn respond_to_list_files(
        &self,
        req_id: u16,
        hash: Sha1Hash,
        peer: SocketAddrV4,
    ) -> Result<()> {
        let snapshots = if hash.is_blank() {
            self.catalogue.list_files().await?
        } else {
            match self.catalogue.contains(&hash).await {
                Ok(snapshot) => vec![snapshot],
                Err(_) => Vec::new(),
            }
        };

        let response = Message::ListFilesResponse {
            req_id,
            files: snapshots.iter().map(list_entry).collect(),
        };
        self.socket
            .send_to(&response.serialize(), peer)
            .await
            .context("failed to send list-files response")?;
        Ok(())
    }

    /// Start (or restart) an upload toward `peer`. A second
    /// OpenConnection for a live endpoint rewinds the existing sender
    /// instead of allocating a new one.
    async fn start_upload(
        &self,
        hash: Sha1Hash,
        chunk: u16,
        window_cap: u16,
        peer: SocketAddrV4,
    ) -> Result<()> {
        let key = (*peer.ip(), peer.port());

        if let Some(handle) = self.uploads.get(&key) {
            tracing::debug!(%peer, %hash, chunk, "reusing existing upload");
            let _ = handle.events.try_send(SenderEvent::Restart);
            return Ok(());
        }

        // declines (unknown hash, chunk not local, oversized chunk)
        // bubble up and are logged; nothing goes back on the wire
        let reader = self.catalogue.get_chunk_reader(&hash, chunk).await?;

        let mut sender = SenderTransfer::new(
            reader,
            window_cap,
            Arc::clone(&self.socket),
            SocketAddr::V4(peer),
        );

        let stamp = self.next_upload_stamp.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(usize::from(window_cap.max(1)));
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        self.uploads.insert(
            key,
            UploadHandle {
                stamp,
                events: events_tx,
                cancel: cancel_tx,
            },
        );

        tracing::info!(%peer, %hash, chunk, window_cap, "upload starting");
        let uploads = Arc::clone(&self.uploads);
        tokio::spawn(async move {
            match sender.kickstart().await {
                Ok(()) => sender.run(events_rx, cancel_rx).await,
                Err(e) => tracing::warn!(error = %e, "upload kickstart failed"),
            }
            uploads.remove_if(&key, |_, handle| handle.stamp == stamp);
        });
        Ok(())
    }

    fn continue_upload(&self, offset: u32, peer: SocketAddrV4) {
        let key = (*peer.ip(), peer.port());
        match self.uploads.get(&key) {
            Some(handle) => {
                // a full event queue means the window math is already
                // saturated; dropping the ack is safe
                let _ = handle.events.try_send(SenderEvent::Ack(offset));
            }
            None => {
                tracing::trace!(%peer, offset, "ack for unknown upload discarded");
            }
        }
    }

    fn deliver_response(&self, response: Message) {
        let req_id = match &response {
            Message::DiscoverHostResponse { req_id, .. } => *req_id,
            Message::ListFilesResponse { req_id, .. } => *req_id,
            _ => return,
        };
        let key = (req_id, response.tag());
        match self.waiters.get(&key) {
            Some(waiter) => {
                let _ = waiter.try_send(response);
            }
            None => {
                tracing::debug!(req_id, tag = key.1, "response with no waiter discarded");
            }
        }
    }

    // ── Requester side ───────────────────────────────────────────────────────

    fn next_request_id(&self) -> u16 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register_waiter(&self, req_id: u16, tag: u8) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        self.waiters.insert((req_id, tag), tx);
        rx
    }

    fn unregister_waiter(&self, req_id: u16, tag: u8) {
        self.waiters.remove(&(req_id, tag));
    }

    /// Broadcast a DiscoverHostRequest and collect every response that
    /// arrives within the discovery window. Many peers may answer one
    /// broadcast; the caller gets them all, self included.
    pub async fn discover_hosts(
        &self,
        hash: Sha1Hash,
        chunks: Vec<u16>,
    ) -> Result<Vec<DiscoveredHost>> {
        let req_id = self.next_request_id();
        let mut responses = self.register_waiter(req_id, wire::TAG_DISCOVER_HOST_RESPONSE);

        let request = Message::DiscoverHostRequest {
            req_id,
            hash,
            chunks,
        };
        let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);
        if let Err(e) = self.socket.send_to(&request.serialize(), broadcast).await {
            self.unregister_waiter(req_id, wire::TAG_DISCOVER_HOST_RESPONSE);
            return Err(e).context("failed to broadcast discovery request");
        }

        let deadline = Instant::now() + DISCOVERY_WINDOW;
        let mut hosts = Vec::new();
        loop {
            match timeout_at(deadline, responses.recv()).await {
                Ok(Some(Message::DiscoverHostResponse {
                    addr, port, chunks, ..
                })) => hosts.push(DiscoveredHost { addr, port, chunks }),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        self.unregister_waiter(req_id, wire::TAG_DISCOVER_HOST_RESPONSE);
        tracing::debug!(%hash, responders = hosts.len(), "discovery window closed");
        Ok(hosts)
    }

    /// Ask one host for its catalogue listing (or one file of it, with a
    /// non-blank hash). One response, bounded deadline.
    pub async fn list_files_on_host(
        &self,
        host: SocketAddrV4,
        hash: Sha1Hash,
    ) -> Result<Vec<ListFilesEntry>> {
        let req_id = self.next_request_id();
        let mut responses = self.register_waiter(req_id, wire::TAG_LIST_FILES_RESPONSE);

        let request = Message::ListFilesRequest { req_id, hash };
        let send_result = self.socket.send_to(&request.serialize(), host).await;
        if let Err(e) = send_result {
            self.unregister_waiter(req_id, wire::TAG_LIST_FILES_RESPONSE);
            return Err(e).context("failed to send list-files request");
        }

        let deadline = Instant::now() + LIST_FILES_DEADLINE;
        let outcome = timeout_at(deadline, responses.recv()).await;
        self.unregister_waiter(req_id, wire::TAG_LIST_FILES_RESPONSE);

        match outcome {
            Ok(Some(Message::ListFilesResponse { files, .. })) => Ok(files),
            Ok(_) => bail!("list-files waiter closed unexpectedly"),
            Err(_) => bail!(
                "no list-files reply from {host} within {}s",
                LIST_FILES_DEADLINE.as_secs()
            ),
        }
    }

    // ── Transfer bookkeeping ─────────────────────────────────────────────────

    /// Claim the (file, peer) slot for a chunk fetch. False if one is
    /// already in flight against that peer.
    pub fn claim_chunk_fetch(&self, hash: Sha1Hash, peer: Ipv4Addr) -> bool {
        self.chunk_fetches.insert((hash, peer), ()).is_none()
    }

    pub fn release_chunk_fetch(&self, hash: Sha1Hash, peer: Ipv4Addr) {
        self.chunk_fetches.remove(&(hash, peer));
    }

    /// Claim the per-file download loop. False if one is already running.
    pub fn claim_download(&self, hash: Sha1Hash) -> bool {
        self.active_downloads.insert(hash, ()).is_none()
    }

    pub fn release_download(&self, hash: Sha1Hash) {
        self.active_downloads.remove(&hash);
    }

    /// Signal every live upload to stop at its next iteration boundary.
    pub fn cancel_uploads(&self) {
        for entry in self.uploads.iter() {
            let _ = entry.value().cancel.try_send(());
        }
    }
}

fn list_entry(snapshot: &RecordSnapshot) -> ListFilesEntry {
    ListFilesEntry {
        size_bytes: snapshot.size_bytes,
        chunk_count: snapshot.chunk_count() as u32,
        chunk_size: snapshot.chunk_size,
        chunks_downloaded: snapshot.chunks_downloaded() as u32,
        hash: snapshot.hash,
        file_name: snapshot.file_name(),
    }
}

/// A UDP socket that can send to the limited broadcast address, bound to
/// the shared port on all interfaces.
fn make_broadcast_socket(port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket.into())
}

// The address the LAN's router assigned us, found by asking the routing
// table which source address would reach an outside host. No packet is
// sent; UDP connect only selects a route.
fn lan_ipv4() -> Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect(("8.8.8.8", 53))?;
    match probe.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => bail!("expected IPv4 local address"),
    }
}
