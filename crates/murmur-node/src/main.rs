//! # murmur-node
//!
//! Console front-end for a Murmur node: peer-to-peer encrypted messaging and
//! file transfer on the local network.
//!
//! Events are written to stdout as JSON lines, commands are read from stdin
//! and logs go to stderr.

mod config;
mod console;

use murmur_net::{forward_discovered, load_static_peers, parse_peer_addrs, spawn_node, LocalProfile};
use murmur_shared::identity::Identity;
use murmur_store::Database;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::NodeSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_net=debug,murmur_store=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Murmur node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let settings = NodeSettings::from_env();
    info!(
        listen = %settings.node.listen_socket(),
        download_dir = %settings.node.download_dir.display(),
        padding = settings.node.use_padding,
        encrypted_db = settings.db_key.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Open the database
    // -----------------------------------------------------------------------
    let db_path = match settings.db_path.clone() {
        Some(path) => path,
        None => Database::default_path()?,
    };
    #[cfg(feature = "sqlcipher")]
    let db = match &settings.db_key {
        Some(key) => Database::open_encrypted(&db_path, key)?,
        None => Database::open_at(&db_path)?,
    };
    #[cfg(not(feature = "sqlcipher"))]
    let db = {
        if settings.db_key.is_some() {
            warn!("MURMUR_DB_KEY ignored: built without the sqlcipher feature");
        }
        Database::open_at(&db_path)?
    };
    db.clear_temporary_files()?;
    let pruned = db.prune_avatars()?;
    if pruned > 0 {
        info!(pruned, "Removed unreferenced avatars");
    }

    // -----------------------------------------------------------------------
    // 4. Load or create the identity
    // -----------------------------------------------------------------------
    let record = match db.load_identity()? {
        Some(record) => record,
        None => {
            info!("No identity found, generating a new one");
            db.create_identity(&Identity::generate(), &settings.name)?
        }
    };
    let identity = record.identity();
    let profile = LocalProfile {
        name: record.name.clone(),
        avatar: record.avatar.clone(),
    };
    info!(
        name = %profile.name,
        fingerprint = %identity.fingerprint(),
        "Identity loaded"
    );

    // -----------------------------------------------------------------------
    // 5. Start the node
    // -----------------------------------------------------------------------
    let (handle, mut events, local_addr) =
        spawn_node(settings.node.clone(), identity, profile, Box::new(db)).await?;
    info!(addr = %local_addr, "Node started");

    // -----------------------------------------------------------------------
    // 6. Dial configured peers
    // -----------------------------------------------------------------------
    let mut peers = parse_peer_addrs(&settings.peers);
    if let Some(path) = &settings.peers_file {
        peers.extend(load_static_peers(path));
    }
    let (peer_tx, peer_rx) = mpsc::channel(peers.len().max(1));
    tokio::spawn(forward_discovered(peer_rx, handle.clone()));
    for ip in peers {
        if peer_tx.send(ip).await.is_err() {
            warn!("Discovery bridge closed early");
            break;
        }
    }

    // -----------------------------------------------------------------------
    // 7. Print events and run the console
    // -----------------------------------------------------------------------
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
        }
    });

    console::run(handle.clone()).await?;

    info!("Shutting down");
    drop(peer_tx);
    if handle.logout().await.is_err() {
        warn!("Node had already stopped");
    }
    let _ = printer.await;

    Ok(())
}
