use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kadnode::{Contact, DhtNode, NodeId, TcpNetwork, DEFAULT_K};

#[derive(Parser, Debug)]
#[command(name = "kadnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for incoming RPCs.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Bootstrap peer as <ip>:<port>; omit to start a new network.
    bootstrap: Option<String>,

    /// Seconds between diagnostic snapshot log lines.
    #[arg(short, long, default_value = "300")]
    snapshot_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let id = NodeId::generate();
    let contact = Contact::new(id, Ipv4Addr::LOCALHOST, args.port);
    info!(%id, port = args.port, "initialized node");

    let node = DhtNode::new(contact, TcpNetwork, DEFAULT_K);

    match &args.bootstrap {
        None => {
            info!("no bootstrap address provided, starting a new network");
        }
        Some(addr) => {
            info!(%addr, "joining network via bootstrap node");
            node.join(addr).await.context("failed to join network")?;
        }
    }

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(port = args.port, "listening for RPCs");

    let mut serve = tokio::spawn(kadnode::serve(listener, node.clone()));
    let mut interval = time::interval(Duration::from_secs(args.snapshot_interval.max(1)));
    interval.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                return Ok(());
            }
            _ = interval.tick() => {
                let snapshot = node.snapshot().await;
                info!(
                    stored_keys = snapshot.stored_keys,
                    contacts = snapshot.contacts,
                    k = snapshot.k,
                    "node snapshot"
                );
            }
            result = &mut serve => {
                return result.context("server task panicked")?;
            }
        }
    }
}
