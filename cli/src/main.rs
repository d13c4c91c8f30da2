//! Interactive console and miner binary.
//!
//! Owns one `registry_core::Store` (spec §4.7, one store per node),
//! connects to a `registry-daemon` for message relay, and offers the
//! `exit`/`help`/`uuids`/`new op` commands described in spec §6. With
//! `-m`, buffered operations are minted into a block once the configured
//! threshold is reached.

mod framing;

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use registry_core::block::Block;
use registry_core::config::NodeConfig;
use registry_core::ingest;
use registry_core::keys::User;
use registry_core::operation::Operation;
use registry_core::revision::Revision;
use registry_core::signed_object::SignedObject;
use registry_core::store::Store;
use uuid::Uuid;

/// Console and miner for a decentralized UUID registry node.
#[derive(Parser, Debug)]
#[command(name = "registry-cli")]
struct Args {
    /// Run as a miner: accumulate operations and mint a block once the
    /// threshold is reached.
    #[arg(short = 'm', long)]
    miner: bool,

    /// Hex-encoded PKCS#8 DER private key to use instead of generating one.
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Address of the `registry-daemon` to connect to.
    #[arg(long, default_value = "127.0.0.1:7878")]
    daemon: String,

    /// Path to this node's on-disk store.
    #[arg(long, default_value = "registry-data-cli")]
    store: String,

    /// Use an in-memory store instead of RocksDB (demos/tests).
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "registry_cli=info,registry_core=info".into()))
        .init();

    let args = Args::parse();

    let user = match build_user(args.key.as_deref()) {
        Ok(user) => user,
        Err(e) => {
            eprintln!("argument error: {e}");
            std::process::exit(2);
        }
    };

    let mut config = NodeConfig::default();
    config.storage.in_memory = args.memory;
    config.storage.path = args.store.clone();
    config.mining.difficulty = if args.memory { 1 } else { config.mining.difficulty };

    let store = if config.storage.in_memory {
        Store::open_memory()
    } else {
        Store::open_rocksdb(&config.storage.path)
    };
    let store = match store {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            eprintln!("failed to open store: {e}");
            std::process::exit(2);
        }
    };

    let stream = match TcpStream::connect(&args.daemon).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("failed to connect to daemon at {}: {e}", args.daemon);
            std::process::exit(2);
        }
    };

    let (mut read_half, write_half) = stream.into_split();
    if let Err(e) = write_half_send_handshake(&write_half, &user).await {
        eprintln!("handshake failed: {e}");
        std::process::exit(2);
    }
    let write_half = Arc::new(Mutex::new(write_half));

    println!("Private key (PKCS#8 DER, hex): {}", hex::encode(user.private_key_der()));
    println!("\nRegistry User/Miner Console\n(type 'help' for help, 'exit' to exit)");

    let pending = Arc::new(Mutex::new(Vec::<Operation>::new()));
    let seen = Arc::new(Mutex::new(HashSet::<[u8; 32]>::new()));

    let network_store = store.clone();
    let network_write = write_half.clone();
    let network_pending = pending.clone();
    let network_seen = seen.clone();
    let is_miner = args.miner;
    let threshold = config.mining.operations_threshold;
    let difficulty = config.mining.difficulty;
    let network_task = tokio::spawn(async move {
        if let Err(e) = network_loop(
            &mut read_half,
            network_store,
            network_write,
            network_pending,
            network_seen,
            is_miner,
            threshold,
            difficulty,
        )
        .await
        {
            tracing::warn!(error = %e, "network loop ended");
        }
    });

    run_console(&store, &write_half, &user).await;

    network_task.abort();
    println!("Goodbye.");
}

fn build_user(key_hex: Option<&str>) -> Result<User, String> {
    match key_hex {
        Some(hex_key) => {
            let der = hex::decode(hex_key).map_err(|e| format!("malformed -k hex: {e}"))?;
            User::from_pkcs8_der(&der).map_err(|e| format!("malformed -k private key: {e}"))
        }
        None => Ok(User::generate()),
    }
}

async fn write_half_send_handshake(write_half: &tokio::net::tcp::OwnedWriteHalf, user: &User) -> std::io::Result<()> {
    write_half.writable().await?;
    // A fresh OwnedWriteHalf always accepts a direct write here; this call
    // only needs `&self`'s `try_write` semantics, so take a transient lock
    // path through `write_all` via a short-lived mutable borrow.
    let mut half = write_half;
    AsyncWriteExt::write_all(&mut half, user.public_key().der()).await
}

#[allow(clippy::too_many_arguments)]
async fn network_loop(
    read_half: &mut (impl tokio::io::AsyncRead + Unpin),
    store: Arc<Mutex<Store>>,
    write_half: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    pending: Arc<Mutex<Vec<Operation>>>,
    seen: Arc<Mutex<HashSet<[u8; 32]>>>,
    is_miner: bool,
    threshold: u32,
    difficulty: u32,
) -> std::io::Result<()> {
    loop {
        let mut tag = [0u8; 2];
        if let Err(e) = read_half.read_exact(&mut tag).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e);
        }

        match &tag {
            b"OP" => {
                let body = framing::read_operation_message(read_half).await?;
                let Ok(op) = Operation::from_raw(&body) else {
                    tracing::warn!("malformed operation from daemon");
                    continue;
                };
                let Ok(op_id) = op.id() else { continue };

                if !is_miner {
                    continue;
                }
                let mut seen_guard = seen.lock().await;
                let already_known = {
                    let guard = store.lock().await;
                    guard.has_operation(&op_id).unwrap_or(true)
                };
                if already_known || !seen_guard.insert(op_id) {
                    continue;
                }
                drop(seen_guard);

                let mut buffer = pending.lock().await;
                buffer.push(op);
                let ready = buffer.len() as u32 >= threshold;
                let drained: Vec<Operation> = if ready { buffer.drain(..).collect() } else { Vec::new() };
                drop(buffer);

                if !drained.is_empty() {
                    try_mint_and_send(&store, &write_half, drained, difficulty).await;
                }
            }
            b"BL" => {
                let body = framing::read_block_message(read_half).await?;
                match Block::from_raw_with_operations(&body) {
                    Ok(block) => {
                        let mut guard = store.lock().await;
                        match ingest::update_blocks(&mut guard, vec![block], None) {
                            Ok(()) => tracing::info!("block accepted"),
                            Err(e) => tracing::warn!(error = %e, "block rejected"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed block from daemon"),
                }
            }
            _ => tracing::warn!(tag = ?tag, "unknown tag from daemon"),
        }
    }
}

async fn try_mint_and_send(
    store: &Arc<Mutex<Store>>,
    write_half: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    operations: Vec<Operation>,
    difficulty: u32,
) {
    // Mining needs a signing identity distinct from any owner's; in this
    // single-process CLI the miner signs with its own session key, same as
    // the console's "new op" signer.
    let miner = User::generate();
    let mut guard = store.lock().await;
    let previous = Revision::from_id(guard.tree().head());
    let operations_limit = operations.len().clamp(2, 10) as u32;
    let mut block = match Block::new(previous, current_unix_timestamp(), operations_limit, operations, difficulty) {
        Ok(block) => block,
        Err(e) => {
            tracing::warn!(error = %e, "failed to assemble block");
            return;
        }
    };
    if let Err(e) = block.mine() {
        tracing::warn!(error = %e, "mining failed");
        return;
    }
    if let Err(e) = block.sign(&miner) {
        tracing::warn!(error = %e, "failed to sign block");
        return;
    }

    let wire = match block.raw_with_operations() {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize mined block");
            return;
        }
    };

    if let Err(e) = ingest::update_blocks(&mut guard, vec![block], None) {
        tracing::warn!(error = %e, "locally-mined block was rejected");
        return;
    }
    drop(guard);

    println!("Block minted. Sending.");
    let mut message = b"BL".to_vec();
    message.extend_from_slice(&wire);
    let mut w = write_half.lock().await;
    let _ = w.write_all(&message).await;
}

fn current_unix_timestamp() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

async fn run_console(store: &Arc<Mutex<Store>>, write_half: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>, user: &User) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => break,
        };

        match line.as_str() {
            "exit" => break,
            "help" => print_help(),
            "uuids" => {
                if list_uuids(store).await.is_empty() {
                    println!("No UUIDs minted yet.");
                }
            }
            "new op" => new_operation(store, write_half, user).await,
            "" => {}
            _ => println!("Unknown command. Type 'help' for list of available commands."),
        }
    }
}

fn print_help() {
    println!(
        " HELP\n======\nAvailable commands:\n\
         - exit   -- exit\n\
         - help   -- show this message\n\
         - uuids  -- list minted uuids\n\
         - new op -- create operation\n"
    );
}

/// Prints every known uuid with its current address and returns the list,
/// in a stable order, for `new_operation`'s "choose an existing uuid" menu.
async fn list_uuids(store: &Arc<Mutex<Store>>) -> Vec<Uuid> {
    let guard = store.lock().await;
    let mut uuids = guard.uuids().unwrap_or_default();
    uuids.sort();
    println!(" UUIDS\n=======");
    for (index, uuid) in uuids.iter().enumerate() {
        let address = guard
            .get_identifier(uuid)
            .and_then(|op_id| guard.get_operation(&op_id))
            .map(|op| op.address)
            .unwrap_or_else(|_| "?".into());
        println!("{index}) {uuid} | {address}");
    }
    uuids
}

async fn new_operation(store: &Arc<Mutex<Store>>, write_half: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>, user: &User) {
    println!("Choose UUID:");
    let uuids = list_uuids(store).await;
    println!("{}) mint new uuid", uuids.len());

    print!("index=");
    let Some(index) = read_line().await.and_then(|s| s.trim().parse::<usize>().ok()) else {
        println!("Value error, aborting.");
        return;
    };

    let previous_rev;
    let uuid;
    if index < uuids.len() {
        uuid = uuids[index];
        let guard = store.lock().await;
        let current_op_id = match guard.get_identifier(&uuid) {
            Ok(id) => id,
            Err(_) => {
                println!("Wrong number.");
                return;
            }
        };
        let current_op = match guard.get_operation(&current_op_id) {
            Ok(op) => op,
            Err(_) => return,
        };
        if !current_op.owners.iter().any(|owner| owner == user.public_key()) {
            println!("You do not own this identifier!");
            return;
        }
        previous_rev = Revision::from_id(current_op_id);
    } else if index == uuids.len() {
        uuid = Uuid::new_v4();
        previous_rev = Revision::sentinel();
    } else {
        println!("Wrong number.");
        return;
    }

    print!("address=");
    let Some(address) = read_line().await else {
        return;
    };

    let mut op = Operation::new(previous_rev, uuid, address, vec![user.public_key().clone()]);
    if let Err(e) = op.sign(user) {
        println!("failed to sign operation: {e}");
        return;
    }

    print!("Send operation? (y/n) ");
    let confirmed = matches!(read_line().await.as_deref(), Some("y"));
    if !confirmed {
        return;
    }

    let Ok(raw) = op.raw() else { return };
    let mut message = b"OP".to_vec();
    message.extend_from_slice(&raw);
    let mut w = write_half.lock().await;
    let _ = w.write_all(&message).await;
}

async fn read_line() -> Option<String> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => None,
        Ok(_) => Some(line.trim().to_string()),
        Err(_) => None,
    }
}
