//! The per-file download orchestrator.
//!
//! `start` resolves the file's metadata (discovering a peer and asking
//! it for the listing if the catalogue has no record yet), registers the
//! download, and hands the long-running fetch loop to a background task.
//! Each round of the loop re-discovers who can serve the still-missing
//! ranges, starts one chunk fetch per responding peer, and waits for at
//! least one fetch to finish before going around again. A failed fetch
//! just leaves its chunk missing; the next round retries it, possibly
//! from a different peer.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::task::JoinSet;

use gust_catalogue::CatalogueError;
use gust_core::{ChunkRange, Sha1Hash};

use crate::server::{DiscoveredHost, Server};
use crate::transfer::{fetch_chunk, TransferError};

/// How many missing ranges each discovery round asks about.
const MISSING_RANGE_QUERY: usize = 8;

/// Upper bound on chunk indices considered per scheduling round.
const ROUND_CHUNK_BUDGET: usize = 256;

/// Ensure the file is registered locally and spawn its download loop.
/// Returns once the download is underway; completion happens in the
/// background while the daemon runs.
pub async fn start(server: Arc<Server>, hash: Sha1Hash) -> Result<()> {
    let known = match server.catalogue().contains(&hash).await {
        Ok(_) => true,
        Err(CatalogueError::NotFound(_)) => false,
        Err(e) => return Err(e.into()),
    };

    if !known {
        let hosts = good_hosts(&server, hash, Vec::new()).await?;
        let Some(peer) = hosts.first() else {
            bail!("no hosts on the network have {hash}");
        };

        let entries = server.list_files_on_host(peer.socket_addr(), hash).await?;
        let entry = entries
            .into_iter()
            .find(|e| e.hash == hash)
            .ok_or_else(|| anyhow!("peer {} reported nothing about {hash}", peer.socket_addr()))?;

        server
            .catalogue()
            .register_download(
                entry.size_bytes,
                entry.chunk_count,
                entry.chunk_size,
                hash,
                &entry.file_name,
            )
            .await?;
    }

    if !server.claim_download(hash) {
        tracing::debug!(%hash, "download already running");
        return Ok(());
    }

    tokio::spawn(async move {
        let result = run(&server, hash).await;
        server.release_download(hash);
        match result {
            Ok(()) => tracing::info!(%hash, "download complete"),
            Err(e) => tracing::warn!(%hash, error = %e, "download abandoned"),
        }
    });
    Ok(())
}

async fn run(server: &Arc<Server>, hash: Sha1Hash) -> Result<()> {
    // fetches in flight: the JoinSet owns the tasks, the set of chunk
    // indices keeps two peers off the same chunk
    let mut in_flight: JoinSet<(Ipv4Addr, u16, Result<(), TransferError>)> = JoinSet::new();
    let mut active_chunks: HashSet<u16> = HashSet::new();

    while !server.catalogue().file_complete(&hash).await? {
        let missing = server
            .catalogue()
            .missing_chunks(&hash, MISSING_RANGE_QUERY)
            .await?;
        let wanted = expand_ranges(&missing, ROUND_CHUNK_BUDGET);
        let hosts = good_hosts(server, hash, ChunkRange::flatten(&missing)).await?;

        for host in hosts {
            let peer_ip = host.ip();
            if !server.claim_chunk_fetch(hash, peer_ip) {
                continue; // already fetching this file from that peer
            }

            let advertised = ChunkRange::from_flat(&host.chunks);
            let Some(chunk) = pick_chunk(&wanted, &active_chunks, &advertised) else {
                server.release_chunk_fetch(hash, peer_ip);
                continue;
            };

            active_chunks.insert(chunk);
            let server = Arc::clone(server);
            in_flight.spawn(async move {
                let result = fetch_chunk(server.catalogue(), host.socket_addr(), hash, chunk).await;
                (peer_ip, chunk, result)
            });
            tracing::debug!(%hash, chunk, peer = %peer_ip, "chunk fetch scheduled");
        }

        // progress gate: at least one fetch lands (or fails) per round.
        // With nothing in flight this is a no-op and the 2-second
        // discovery window above paces the retry loop.
        reap(server, hash, &mut in_flight, &mut active_chunks).await;
    }

    // the file completed; drain whatever is still running
    while !in_flight.is_empty() {
        reap(server, hash, &mut in_flight, &mut active_chunks).await;
    }
    Ok(())
}

// Wait for one in-flight fetch and release its claims.
async fn reap(
    server: &Arc<Server>,
    hash: Sha1Hash,
    in_flight: &mut JoinSet<(Ipv4Addr, u16, Result<(), TransferError>)>,
    active_chunks: &mut HashSet<u16>,
) {
    match in_flight.join_next().await {
        Some(Ok((peer_ip, chunk, result))) => {
            server.release_chunk_fetch(hash, peer_ip);
            active_chunks.remove(&chunk);
            if let Err(e) = result {
                tracing::warn!(%hash, chunk, peer = %peer_ip, error = %e, "chunk fetch failed");
            }
        }
        Some(Err(e)) => {
            tracing::warn!(%hash, error = %e, "chunk fetch task panicked");
        }
        None => {}
    }
}

// Responders that actually have something, excluding ourselves.
async fn good_hosts(
    server: &Arc<Server>,
    hash: Sha1Hash,
    chunks: Vec<u16>,
) -> Result<Vec<DiscoveredHost>> {
    let own_addr = server.lan_ip().octets();
    let own_port = server.port();
    Ok(server
        .discover_hosts(hash, chunks)
        .await?
        .into_iter()
        .filter(|h| !h.chunks.is_empty())
        .filter(|h| !(h.addr == own_addr && h.port == own_port))
        .collect())
}

// Inclusive ranges → individual chunk indices, bounded.
fn expand_ranges(ranges: &[ChunkRange], budget: usize) -> Vec<u16> {
    let mut chunks = Vec::new();
    for r in ranges {
        for c in r.start..=r.end {
            if chunks.len() == budget {
                return chunks;
            }
            chunks.push(c);
        }
    }
    chunks
}

// The first wanted chunk this peer advertises that nobody is fetching.
fn pick_chunk(
    wanted: &[u16],
    active: &HashSet<u16>,
    advertised: &[ChunkRange],
) -> Option<u16> {
    wanted
        .iter()
        .copied()
        .find(|c| !active.contains(c) && advertised.iter().any(|r| r.start <= *c && *c <= r.end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_ranges_respects_budget() {
        let ranges = vec![ChunkRange::new(0, 2), ChunkRange::new(5, 5)];
        assert_eq!(expand_ranges(&ranges, 16), vec![0, 1, 2, 5]);
        assert_eq!(expand_ranges(&ranges, 2), vec![0, 1]);
    }

    #[test]
    fn pick_chunk_skips_active_and_unadvertised() {
        let wanted = vec![0, 1, 2, 3];
        let mut active = HashSet::new();
        active.insert(0);
        let advertised = vec![ChunkRange::new(0, 1), ChunkRange::new(3, 3)];

        assert_eq!(pick_chunk(&wanted, &active, &advertised), Some(1));
        active.insert(1);
        assert_eq!(pick_chunk(&wanted, &active, &advertised), Some(3));
        active.insert(3);
        assert_eq!(pick_chunk(&wanted, &active, &advertised), None);
    }
}
