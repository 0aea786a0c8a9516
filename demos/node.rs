use std::{
    str::FromStr,
    sync::mpsc,
    time::{Duration, Instant},
};

use kadht::{Dht, Id};

use clap::Parser;

use tracing::Level;

const DEFAULT_BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on, defaults to 6881 if available
    #[arg(short, long)]
    port: Option<u16>,
    /// Bootstrapping nodes as host:port, defaults to public routers
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// info_hash to lookup peers for
    #[arg(short, long)]
    lookup: Option<String>,
    /// info_hash to announce this node as a peer on
    #[arg(short, long)]
    announce: Option<String>,
    /// Log at DEBUG level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let bootstrap = if cli.bootstrap.is_empty() {
        DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()
    } else {
        cli.bootstrap
    };

    let mut builder = Dht::builder();
    builder.bootstrap(&bootstrap);
    if let Some(port) = cli.port {
        builder.port(port);
    }

    let mut dht = builder.build().expect("Failed to bind the udp socket");

    let start = Instant::now();
    match dht.bootstrap(&[]) {
        Ok(size) => println!(
            "Bootstrapped in {:?} seconds, {} nodes in the routing table",
            start.elapsed().as_secs_f32(),
            size
        ),
        Err(error) => println!("Bootstrap failed: {}", error),
    }

    if let Some(info_hash) = cli.announce {
        let info_hash = Id::from_str(&info_hash).expect("invalid infohash");
        let start = Instant::now();

        match dht.announce(info_hash, None) {
            Ok(result) => println!(
                "Announced to {} nodes ({} failed) in {:?} seconds",
                result.stored_at.len(),
                result.failed,
                start.elapsed().as_secs_f32()
            ),
            Err(error) => println!("Announce failed: {}", error),
        }
    }

    if let Some(info_hash) = cli.lookup {
        let info_hash = Id::from_str(&info_hash).expect("invalid infohash");
        let start = Instant::now();

        match dht.lookup(info_hash) {
            Ok(responses) => {
                for response in responses {
                    if response.finished {
                        println!(
                            "\nLookup done in {:?} milliseconds, got {} peers.",
                            start.elapsed().as_millis(),
                            response.peers.len()
                        );
                    } else {
                        for peer in response.peers {
                            println!("peer {}", peer);
                        }
                    }
                }
            }
            Err(error) => println!("Lookup failed: {}", error),
        }
    }

    let (sender, receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })
    .expect("Error setting Ctrl-C handler");

    println!("\nRunning, press Ctrl-C to stop.");

    while receiver.recv_timeout(Duration::from_secs(60)).is_err() {
        if let Ok(info) = dht.info() {
            println!(
                "id: {} address: {} routing table: {} connections: {} traversals: {}",
                info.id(),
                info.local_addr(),
                info.routing_table_size(),
                info.active_connections(),
                info.running_traversals()
            );
        }
    }

    dht.shutdown();
}
