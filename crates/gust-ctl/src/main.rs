//! gust — command-line client for the gust daemon.
//!
//! One invocation, one request over the daemon's control socket, one
//! reply, exit. Argument mistakes exit 2 before any connection is made;
//! daemon-reported errors print to stderr and exit 1.

use std::io::{BufRead, BufReader, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::process::exit;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gust_core::config::GustConfig;
use gust_core::Sha1Hash;

// ── Control-plane mirror types ───────────────────────────────────────────────
// These match the daemon's JSON shapes field for field.

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Request {
    Share { path: String },
    Clean,
    List { ip: Option<String>, hash: Option<String> },
    Get { hash: String },
    Chims { hash: Option<String> },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Response {
    Share(FileItem),
    Clean(Vec<CleanItem>),
    List(Vec<FileItem>),
    Get,
    Chims(Vec<ChimItem>),
    Error { message: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileItem {
    file_path: String,
    size_bytes: u64,
    hash: String,
    chunk_count: u64,
    chunks_downloaded: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanItem {
    file_path: String,
    indexed_hash: String,
    current_hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChimItem {
    ip: String,
    port: u16,
    chunks: Vec<u16>,
}

const USAGE: &str = "usage:
  gust share <path>        index a local file and serve it to the LAN
  gust clean               drop records whose files are missing or changed
  gust list [ip] [hash]    list the local (or a remote) catalogue
  gust get <hash>          start downloading a file in the background
  gust chims [hash]        discover hosts on the LAN";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = match build_request(&args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("{message}\n\n{USAGE}");
            exit(2);
        }
    };

    match call_daemon(&request).and_then(print_response) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{e:#}");
            exit(1);
        }
    }
}

// Argument parsing and validation. Everything that can be checked
// without the daemon is checked here, so bad input exits 2.
fn build_request(args: &[String]) -> Result<Request, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err("no command supplied".into());
    };

    match command.as_str() {
        "share" => match rest {
            [path] => Ok(Request::Share { path: path.clone() }),
            _ => Err(format!("share expects 1 argument, got {}", rest.len())),
        },
        "clean" => match rest {
            [] => Ok(Request::Clean),
            _ => Err(format!("clean expects no arguments, got {}", rest.len())),
        },
        "list" => {
            let (ip, hash) = match rest {
                [] => (None, None),
                [ip] => (Some(ip), None),
                [ip, hash] => (Some(ip), Some(hash)),
                _ => return Err(format!("list expects at most 2 arguments, got {}", rest.len())),
            };
            if let Some(ip) = ip {
                ip.parse::<Ipv4Addr>()
                    .map_err(|_| format!("invalid IP address: {ip}"))?;
            }
            if let Some(hash) = hash {
                validate_hash(hash)?;
            }
            Ok(Request::List {
                ip: ip.cloned(),
                hash: hash.cloned(),
            })
        }
        "get" => match rest {
            [hash] => {
                validate_hash(hash)?;
                Ok(Request::Get { hash: hash.clone() })
            }
            _ => Err(format!("get expects 1 argument, got {}", rest.len())),
        },
        "chims" => match rest {
            [] => Ok(Request::Chims { hash: None }),
            [hash] => {
                validate_hash(hash)?;
                Ok(Request::Chims {
                    hash: Some(hash.clone()),
                })
            }
            _ => Err(format!("chims expects at most 1 argument, got {}", rest.len())),
        },
        other => Err(format!("unknown command: {other}")),
    }
}

fn validate_hash(hash: &str) -> Result<(), String> {
    Sha1Hash::from_hex(hash)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn call_daemon(request: &Request) -> Result<Response> {
    let config = GustConfig::load().context("failed to load configuration")?;

    let mut stream = UnixStream::connect(&config.control_socket).with_context(|| {
        format!(
            "failed to connect to {} — is gustd running?",
            config.control_socket.display()
        )
    })?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line).context("failed to send request")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("failed to read reply")?;

    serde_json::from_str(&reply).context("failed to parse daemon reply")
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Share(item) => {
            println!("File shared:");
            println!("  Path  : {}", item.file_path);
            println!("  Bytes : {}", item.size_bytes);
            println!("  Hash  : {}", item.hash);
        }
        Response::Clean(items) => {
            if items.is_empty() {
                println!("Catalogue is clean.");
            }
            let blank = Sha1Hash::blank().to_hex();
            for item in items {
                println!("{}", item.file_path);
                if item.current_hash == blank {
                    println!("  - File is missing. Removed from index.");
                } else {
                    println!("  - File has changed since it was shared. Removed from index.");
                    println!("    Indexed hash: {}", item.indexed_hash);
                    println!("    Current hash: {}", item.current_hash);
                }
            }
        }
        Response::List(items) => {
            if items.is_empty() {
                println!("No files indexed.");
            }
            for item in items {
                println!("{}", item.hash);
                println!("  File   : {}", item.file_path);
                println!("  Bytes  : {}", item.size_bytes);
                println!("  Chunks : {}/{}", item.chunks_downloaded, item.chunk_count);
            }
        }
        Response::Get => {
            println!("Transfer initiated.");
        }
        Response::Chims(hosts) => {
            if hosts.is_empty() {
                println!("No hosts responded.");
            }
            for host in hosts {
                println!("IP: {}:{}", host.ip, host.port);
                for pair in host.chunks.chunks_exact(2) {
                    println!("  {}:{}", pair[0], pair[1]);
                }
            }
        }
        Response::Error { message } => anyhow::bail!("{message}"),
    }
    Ok(())
}
