//! depgraph server - Unix socket server for GraphStore
//!
//! Provides a MessagePack-based protocol for dependency graph operations.
//! Multiple clients can connect and share the same store and caches.
//!
//! Usage:
//!   depgraph-server /path/to/graph.sled [--socket /tmp/depgraph.sock]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use depgraph::storage::Attributes;
use depgraph::{
    DirectEdge, Direction, EdgeKey, EdgeMutation, FetchOptions, GraphConfig, GraphStore, SetEdgesRequest, SledStore,
};

const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    UpdateEdges { edges: Vec<WireMutation> },
    SetEdges { requests: Vec<SetEdgesRequest> },

    GetNodes { keys: Vec<String> },
    GetEdges { edges: Vec<EdgeKey> },
    GetGraph {
        roots: Vec<String>,
        #[serde(default)]
        direction: Direction,
        #[serde(default, rename = "fetchEdges")]
        fetch_edges: bool,
    },

    Invalidate { key: String },
    Flush,
    Clear,
    Ping,
    Shutdown,
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: bool },
    Error { error: String },
    Nodes { nodes: Vec<WireNode> },
    Edges { edges: Vec<WireEdge> },
    Graph { nodes: Vec<String>, edges: Vec<WireEdge> },
    Pong { pong: bool, version: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMutation {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub payload: Option<Attributes>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNode {
    pub key: String,
    pub forward: Vec<DirectEdge>,
    pub back: Vec<DirectEdge>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEdge {
    pub from: String,
    pub to: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Attributes>,
}

impl From<WireMutation> for EdgeMutation {
    fn from(wire: WireMutation) -> Self {
        let mutation = if wire.delete {
            EdgeMutation::delete(wire.from, wire.to, wire.context)
        } else {
            EdgeMutation::put(wire.from, wire.to, wire.context)
        };
        match wire.payload {
            Some(payload) => mutation.with_payload(payload),
            None => mutation,
        }
    }
}

// ============================================================================
// Request Handler
// ============================================================================

async fn handle_request(store: &GraphStore, request: Request) -> depgraph::Result<Response> {
    let response = match request {
        Request::UpdateEdges { edges } => {
            store
                .update_graph_storage(edges.into_iter().map(EdgeMutation::from).collect())
                .await?;
            Response::Ok { ok: true }
        }
        Request::SetEdges { requests } => {
            store.set_edges(requests).await?;
            Response::Ok { ok: true }
        }
        Request::GetNodes { keys } => {
            let nodes = store
                .get_nodes(&keys)
                .await?
                .into_iter()
                .map(|node| WireNode {
                    key: node.key,
                    forward: node.forward.edges,
                    back: node.back.edges,
                })
                .collect();
            Response::Nodes { nodes }
        }
        Request::GetEdges { edges } => {
            let edges = store
                .get_edges(&edges)
                .await?
                .into_iter()
                .map(|edge| WireEdge {
                    from: edge.from,
                    to: edge.to,
                    context: edge.data.context,
                    payload: edge.data.payload,
                })
                .collect();
            Response::Edges { edges }
        }
        Request::GetGraph { roots, direction, fetch_edges } => {
            let graph = store
                .get_graph(&roots, direction, FetchOptions { fetch_edges })
                .await?;
            Response::Graph {
                nodes: graph.keys().cloned().collect(),
                edges: graph
                    .edges()
                    .iter()
                    .map(|edge| WireEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        context: edge.data.context.clone(),
                        payload: edge.data.payload.clone(),
                    })
                    .collect(),
            }
        }
        Request::Invalidate { key } => {
            store.invalidate(&key);
            Response::Ok { ok: true }
        }
        Request::Flush => {
            store.flush().await?;
            Response::Ok { ok: true }
        }
        Request::Clear => {
            store.clear();
            Response::Ok { ok: true }
        }
        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        Request::Shutdown => {
            store.flush().await?;
            Response::Ok { ok: true }
        }
    };
    Ok(response)
}

// ============================================================================
// Client Connection Handler
// ============================================================================

async fn read_message(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_message(stream: &mut UnixStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

async fn handle_client(
    mut stream: UnixStream,
    store: Arc<GraphStore>,
    backend: Arc<SledStore>,
    client_id: usize,
    socket_path: String,
) {
    info!("Client {} connected", client_id);

    loop {
        let msg = match read_message(&mut stream).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!("Client {} disconnected", client_id);
                break;
            }
            Err(e) => {
                warn!("Client {} read error: {}", client_id, e);
                break;
            }
        };

        let (response, is_shutdown) = match rmp_serde::from_slice::<Request>(&msg) {
            Ok(request) => {
                let is_shutdown = matches!(request, Request::Shutdown);
                let response = handle_request(&store, request)
                    .await
                    .unwrap_or_else(|e| Response::Error { error: e.to_string() });
                (response, is_shutdown)
            }
            Err(e) => (
                Response::Error {
                    error: format!("Invalid request: {}", e),
                },
                false,
            ),
        };

        let resp_bytes = match rmp_serde::to_vec_named(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Serialize error: {}", e);
                continue;
            }
        };

        if let Err(e) = write_message(&mut stream, &resp_bytes).await {
            warn!("Client {} write error: {}", client_id, e);
            break;
        }

        if is_shutdown {
            info!("Shutdown requested by client {}", client_id);
            if let Err(e) = backend.flush().await {
                error!("Flush failed: {}", e);
            }
            let _ = std::fs::remove_file(&socket_path);
            std::process::exit(0);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn parse_args() -> anyhow::Result<(PathBuf, String)> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        bail!(
            "Usage: depgraph-server <db-path> [--socket <socket-path>]\n\n\
             Arguments:\n  \
             <db-path>      Path to the sled database directory\n  \
             --socket       Unix socket path (default: /tmp/depgraph.sock)"
        );
    }

    let db_path = PathBuf::from(&args[1]);
    let socket_path = args
        .iter()
        .position(|a| a == "--socket")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("/tmp/depgraph.sock")
        .to_string();
    Ok((db_path, socket_path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("DEPGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let (db_path, socket_path) = parse_args()?;

    // Remove stale socket file
    let _ = std::fs::remove_file(&socket_path);

    info!("Opening database: {:?}", db_path);
    let backend = Arc::new(SledStore::open(&db_path).with_context(|| format!("opening {:?}", db_path))?);
    let config = GraphConfig::from_env().context("reading DEPGRAPH_* configuration")?;
    let store = Arc::new(GraphStore::new(backend.clone(), config)?);
    info!("Database opened: {} rows", backend.len());

    let listener = UnixListener::bind(&socket_path).with_context(|| format!("binding {}", socket_path))?;
    info!("Listening on {}", socket_path);

    // Graceful shutdown: finish cache write-backs, flush sled, drop the socket
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
        .context("registering signal handlers")?;
    let runtime = tokio::runtime::Handle::current();
    let store_for_signal = Arc::clone(&store);
    let backend_for_signal = Arc::clone(&backend);
    let socket_path_for_signal = socket_path.clone();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {}, flushing...", sig);
            let flushed = runtime.block_on(async {
                store_for_signal.flush().await?;
                backend_for_signal.flush().await
            });
            match flushed {
                Ok(()) => info!("Flush complete"),
                Err(e) => error!("Flush failed: {}", e),
            }
            let _ = std::fs::remove_file(&socket_path_for_signal);
            info!("Exiting");
            std::process::exit(0);
        }
    });

    let mut client_id = 0;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                client_id += 1;
                tokio::spawn(handle_client(
                    stream,
                    Arc::clone(&store),
                    Arc::clone(&backend),
                    client_id,
                    socket_path.clone(),
                ));
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}
