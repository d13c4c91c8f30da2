//! TCP broadcaster binary.
//!
//! Accepts peer connections, reads each client's DER public key as a
//! handshake, then relays `OP`/`BL`-tagged messages to every connected
//! peer including the sender (spec §6, "Wire protocol"), after handing
//! each decoded payload to `registry_core` for validation and ingest.
//! Unknown tags are dropped without being rebroadcast.

mod framing;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use registry_core::block::Block;
use registry_core::config::NodeConfig;
use registry_core::ingest;
use registry_core::metrics::{run_prometheus_http_server, MetricsRegistry};
use registry_core::operation::Operation;
use registry_core::signed_object::Verified;
use registry_core::store::Store;

const BROADCAST_CAPACITY: usize = 256;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "registry_daemon=info,registry_core=info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "daemon exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let mut config = NodeConfig::default();
    if let Some(path) = std::env::args().nth(1) {
        config.storage.path = path;
    }

    let store = if config.storage.in_memory {
        Store::open_memory()
    } else {
        Store::open_rocksdb(&config.storage.path)
    }
    .map_err(|e| format!("failed to open store: {e}"))?;
    let store = Arc::new(Mutex::new(store));

    let metrics = Arc::new(MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics: {e}"))?);
    if config.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = config.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::warn!(error = %e, "metrics HTTP server stopped");
            }
        });
        tracing::info!(%addr, "metrics exporter listening");
    }

    let (tx, _rx) = broadcast::channel::<(SocketAddr, Vec<u8>)>(BROADCAST_CAPACITY);

    let listener = TcpListener::bind(config.network.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.network.listen_addr))?;
    tracing::info!(addr = %config.network.listen_addr, "daemon listening");

    loop {
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| format!("accept failed: {e}"))?;
        let store = store.clone();
        let metrics = metrics.clone();
        let tx = tx.clone();
        let rx = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, store, metrics, tx, rx).await {
                tracing::warn!(%peer_addr, error = %e, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    store: Arc<Mutex<Store>>,
    metrics: Arc<MetricsRegistry>,
    tx: broadcast::Sender<(SocketAddr, Vec<u8>)>,
    mut rx: broadcast::Receiver<(SocketAddr, Vec<u8>)>,
) -> std::io::Result<()> {
    tracing::info!(%peer_addr, "connection accepted");
    let (mut read_half, mut write_half) = stream.into_split();

    let pubkey_der = framing::read_der_pubkey(&mut read_half).await?;
    tracing::info!(%peer_addr, pubkey = %hex::encode(&pubkey_der), "client handshake complete");

    let writer_task = tokio::spawn(async move {
        while let Ok((_, message)) = rx.recv().await {
            if write_half.write_all(&message).await.is_err() {
                break;
            }
        }
    });

    let reader_result = read_loop(&mut read_half, peer_addr, &store, &metrics, &tx).await;
    writer_task.abort();
    reader_result
}

async fn read_loop(
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    peer_addr: SocketAddr,
    store: &Arc<Mutex<Store>>,
    metrics: &Arc<MetricsRegistry>,
    tx: &broadcast::Sender<(SocketAddr, Vec<u8>)>,
) -> std::io::Result<()> {
    loop {
        let mut tag = [0u8; 2];
        if let Err(e) = read_half.read_exact(&mut tag).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                tracing::info!(%peer_addr, "connection closed");
                return Ok(());
            }
            return Err(e);
        }

        match &tag {
            b"OP" => {
                // Operations travel standalone until a miner folds them into
                // a block; the daemon only checks signature/semantics plus
                // a read-only chain check (ownership, predecessor), it never
                // persists them (spec §4.3, persistence happens via blocks).
                let body = framing::read_operation_message(read_half).await?;
                let accepted = match Operation::from_raw(&body).and_then(Verified::verify) {
                    Ok(verified) => {
                        let mut op = verified.into_inner();
                        let guard = store.lock().await;
                        match op.verify_chain(&guard) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::warn!(%peer_addr, error = %e, "rejected operation");
                                false
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "malformed or invalid operation message");
                        false
                    }
                };
                if accepted {
                    metrics.ingest.operations_ingested.inc();
                } else {
                    metrics.ingest.operations_rejected.inc();
                }
                let mut message = tag.to_vec();
                message.extend_from_slice(&body);
                let _ = tx.send((peer_addr, message));
            }
            b"BL" => {
                let body = framing::read_block_message(read_half).await?;
                let start = std::time::Instant::now();
                let accepted = match Block::from_raw_with_operations(&body) {
                    Ok(block) => {
                        let mut guard = store.lock().await;
                        match ingest::update_blocks(&mut guard, vec![block], Some(&metrics.ingest)) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::warn!(%peer_addr, error = %e, "rejected block");
                                false
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "malformed block message");
                        false
                    }
                };
                metrics.ingest.block_validation_seconds.observe(start.elapsed().as_secs_f64());
                if accepted {
                    metrics.ingest.blocks_ingested.inc();
                } else {
                    metrics.ingest.blocks_rejected.inc();
                }
                let mut message = tag.to_vec();
                message.extend_from_slice(&body);
                let _ = tx.send((peer_addr, message));
            }
            _ => {
                tracing::warn!(%peer_addr, tag = ?tag, "unknown tag, dropping connection framing is now desynchronised");
                return Ok(());
            }
        }
    }
}
