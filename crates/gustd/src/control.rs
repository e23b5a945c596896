//! Control plane: the request/reply surface the CLI talks to.
//!
//! Newline-delimited JSON over a Unix domain socket. A client connects,
//! writes one request line, reads one response line, and goes away.
//! Hashes cross this boundary as 40-char hex strings. Daemon-side
//! failures come back as an `error` payload; the transport itself stays
//! intact.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use gust_catalogue::RecordSnapshot;
use gust_core::wire::ListFilesEntry;
use gust_core::Sha1Hash;

use crate::download;
use crate::server::Server;

// ── Requests and replies ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    /// Index a complete local file and make it available to the LAN.
    Share { path: PathBuf },
    /// Drop records whose backing file is missing or was modified.
    Clean,
    /// List the local catalogue, or a remote host's with `ip`.
    List {
        ip: Option<Ipv4Addr>,
        hash: Option<String>,
    },
    /// Start downloading a file in the background.
    Get { hash: String },
    /// Discover hosts on the LAN, optionally scoped to one file.
    Chims { hash: Option<String> },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlResponse {
    Share(FileItem),
    Clean(Vec<CleanItem>),
    List(Vec<FileItem>),
    Get,
    Chims(Vec<ChimItem>),
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    pub file_path: String,
    pub size_bytes: u64,
    pub hash: String,
    pub chunk_count: u64,
    pub chunk_size: u32,
    pub chunks_downloaded: u64,
}

/// A file removed by `clean`. A blank current hash means the backing
/// file is gone; any other mismatch means it changed since sharing.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanItem {
    pub file_path: String,
    pub indexed_hash: String,
    pub current_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChimItem {
    pub ip: String,
    pub port: u16,
    /// Flat [start, end, ...] chunk range pairs.
    pub chunks: Vec<u16>,
}

impl From<&RecordSnapshot> for FileItem {
    fn from(snapshot: &RecordSnapshot) -> Self {
        FileItem {
            file_path: snapshot.file_path.display().to_string(),
            size_bytes: snapshot.size_bytes,
            hash: snapshot.hash.to_hex(),
            chunk_count: snapshot.chunk_count(),
            chunk_size: snapshot.chunk_size,
            chunks_downloaded: snapshot.chunks_downloaded(),
        }
    }
}

impl From<&ListFilesEntry> for FileItem {
    fn from(entry: &ListFilesEntry) -> Self {
        FileItem {
            file_path: entry.file_name.clone(),
            size_bytes: entry.size_bytes,
            hash: entry.hash.to_hex(),
            chunk_count: u64::from(entry.chunk_count),
            chunk_size: entry.chunk_size,
            chunks_downloaded: u64::from(entry.chunks_downloaded),
        }
    }
}

// ── Listener ─────────────────────────────────────────────────────────────────

/// Accept control connections forever. A stale socket file from a
/// previous run is removed before binding.
pub async fn serve(socket_path: &Path, server: Arc<Server>) -> Result<()> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("failed to remove stale control socket"),
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;
    tracing::info!(path = %socket_path.display(), "control plane listening");

    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, server).await {
                tracing::warn!(error = %e, "control connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, server: Arc<Server>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    if let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(&server, request).await,
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

pub async fn dispatch(server: &Arc<Server>, request: ControlRequest) -> ControlResponse {
    let result = match request {
        ControlRequest::Share { path } => share(server, &path).await,
        ControlRequest::Clean => clean(server).await,
        ControlRequest::List { ip, hash } => list(server, ip, hash.as_deref()).await,
        ControlRequest::Get { hash } => get(server, &hash).await,
        ControlRequest::Chims { hash } => chims(server, hash.as_deref()).await,
    };
    result.unwrap_or_else(|e| ControlResponse::Error {
        message: format!("{e:#}"),
    })
}

async fn share(server: &Arc<Server>, path: &Path) -> Result<ControlResponse> {
    let snapshot = server.catalogue().share_file(path).await?;
    Ok(ControlResponse::Share(FileItem::from(&snapshot)))
}

// Integrity sweep: every fully-downloaded record is rehashed from disk;
// missing or modified files are unshared and reported.
async fn clean(server: &Arc<Server>) -> Result<ControlResponse> {
    let catalogue = server.catalogue();
    let mut removed = Vec::new();

    for snapshot in catalogue.list_files().await? {
        if !snapshot.progress.full() {
            continue; // a partial download has nothing to verify yet
        }
        let current = match catalogue.rehash(&snapshot.hash).await {
            Ok(current) if current == snapshot.hash => continue,
            Ok(current) => current,
            Err(_) => Sha1Hash::blank(),
        };
        catalogue.unshare_file(&snapshot.hash).await?;
        removed.push(CleanItem {
            file_path: snapshot.file_path.display().to_string(),
            indexed_hash: snapshot.hash.to_hex(),
            current_hash: current.to_hex(),
        });
    }
    Ok(ControlResponse::Clean(removed))
}

async fn list(
    server: &Arc<Server>,
    ip: Option<Ipv4Addr>,
    hash: Option<&str>,
) -> Result<ControlResponse> {
    let hash = parse_optional_hash(hash)?;

    let items = match ip {
        Some(ip) => {
            let host = SocketAddrV4::new(ip, server.port());
            let entries = server
                .list_files_on_host(host, hash.unwrap_or_else(Sha1Hash::blank))
                .await?;
            entries.iter().map(FileItem::from).collect()
        }
        None => {
            let snapshots = server.catalogue().list_files().await?;
            snapshots
                .iter()
                .filter(|s| hash.is_none_or(|h| s.hash == h))
                .map(FileItem::from)
                .collect()
        }
    };
    Ok(ControlResponse::List(items))
}

async fn get(server: &Arc<Server>, hash: &str) -> Result<ControlResponse> {
    let hash = Sha1Hash::from_hex(hash)?;
    download::start(Arc::clone(server), hash).await?;
    Ok(ControlResponse::Get)
}

async fn chims(server: &Arc<Server>, hash: Option<&str>) -> Result<ControlResponse> {
    let hash = parse_optional_hash(hash)?.unwrap_or_else(Sha1Hash::blank);
    let hosts = server.discover_hosts(hash, Vec::new()).await?;
    Ok(ControlResponse::Chims(
        hosts
            .into_iter()
            .map(|h| ChimItem {
                ip: h.ip().to_string(),
                port: h.port,
                chunks: h.chunks,
            })
            .collect(),
    ))
}

fn parse_optional_hash(hash: Option<&str>) -> Result<Option<Sha1Hash>> {
    hash.map(Sha1Hash::from_hex).transpose().map_err(Into::into)
}
