/// gossipd - run a gossip node from the command line
///
/// Usage:
///   gossipd start [--peer <addr:port>]... [--publish <data>]  - Run a node
///   gossipd hash-secret <secret>                              - Print a secret's wire form
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gossipcast::config::DEFAULT_PORT;
use gossipcast::prelude::*;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

/// gossipd - membership and metadata gossip
#[derive(Parser)]
#[command(name = "gossipd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "info" or "gossipcast=debug"
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gossip node until Ctrl+C
    ///
    /// Examples:
    ///   gossipd start --addr 10.0.0.1
    ///   gossipd start --addr 10.0.0.2 --peer 10.0.0.1:8000 --secret s3cret
    Start {
        /// Address other nodes reach this node at
        #[arg(short, long, default_value = "127.0.0.1")]
        addr: IpAddr,

        /// Gossip port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to bind (default: same as --addr)
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Display name
        #[arg(short, long, default_value = "")]
        name: String,

        /// Link-layer address advertised to peers
        #[arg(long, default_value = "")]
        mac: String,

        /// Local link the offload program is attached to
        #[arg(long, default_value = "")]
        link: String,

        /// Transport: udp or tcp
        #[arg(short, long, default_value = "udp")]
        mode: TransportMode,

        /// Seed peer (repeatable)
        #[arg(long = "peer", value_name = "ADDR:PORT")]
        peers: Vec<SocketAddr>,

        /// Shared cluster secret
        #[arg(short, long, default_value = "")]
        secret: String,

        /// Peers contacted per hop
        #[arg(long, default_value_t = gossipcast::config::DEFAULT_AMOUNT)]
        amount: usize,

        /// Heartbeat cycle in seconds
        #[arg(long, default_value_t = 6)]
        cycle: u64,

        /// Membership TTL in seconds (0: derived from the cycle)
        #[arg(long, default_value_t = 0)]
        timeout: u64,

        /// Metadata to publish once joined
        #[arg(long)]
        publish: Option<String>,
    },

    /// Print the hashed form of a secret as it appears on the wire
    HashSecret {
        /// Plain-text secret
        secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log.as_deref() {
        Some(directives) => EnvFilter::try_new(directives).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).compact().init();

    match cli.command {
        Commands::Start {
            addr,
            port,
            bind,
            name,
            mac,
            link,
            mode,
            peers,
            secret,
            amount,
            cycle,
            timeout,
            publish,
        } => {
            let config = GossipConfig::new()
                .listen_addr(bind.unwrap_or(addr))
                .amount(amount)
                .cycle(Duration::from_secs(cycle))
                .timeout(Duration::from_secs(timeout))
                .secret_key(&secret)
                .mode(mode);
            let local = Node::new(addr.to_string(), port)
                .with_name(name)
                .with_mac(mac)
                .with_link_name(link);
            run_node(local, config, peers, publish).await
        }
        Commands::HashSecret { secret } => {
            println!("{}", gossipcast::config::hash_secret(&secret));
            Ok(())
        }
    }
}

/// Run a node until Ctrl+C.
async fn run_node(
    local: Node,
    config: GossipConfig,
    peers: Vec<SocketAddr>,
    publish: Option<String>,
) -> Result<()> {
    let config = config.normalized().context("Invalid configuration")?;
    let listen_ip = config
        .listen_addr
        .context("Listen address not set")?;
    let bind_addr = SocketAddr::new(listen_ip, local.port);

    let transport: Arc<dyn Transport> = match config.mode {
        TransportMode::Udp => Arc::new(
            UdpTransport::bind(bind_addr, config.size)
                .await
                .context("Failed to bind UDP socket")?,
        ),
        TransportMode::Tcp => Arc::new(
            TcpTransport::bind(bind_addr, config.size)
                .await
                .context("Failed to bind TCP listener")?,
        ),
        mode => bail!("{} mode needs a kernel offload program and is not available here", mode),
    };

    let cycle = config.cycle;
    let node = GossipNode::new(local, config, transport).context("Failed to create node")?;

    for peer in &peers {
        node.set(Node::new(peer.ip().to_string(), peer.port()));
    }

    println!("{}", "Starting gossip node...".bold().cyan());
    println!();

    node.join().await.context("Failed to join cluster")?;

    let status = node.status().await;
    println!("  {} {}", "Node:".bright_white(), status.local);
    println!("  {} {}", "Listen:".bright_white(), bind_addr);
    println!("  {} {}", "Mode:".bright_white(), status.mode);
    for peer in &peers {
        println!("  {} {}", "Seed:".bright_white(), peer);
    }

    if let Some(data) = publish {
        let metadata = node
            .publish(data.into_bytes())
            .await
            .context("Failed to publish metadata")?;
        println!("  {} version {}", "Published:".bright_white(), metadata.update);
    }

    println!();
    println!("{}", "Node is running. Press Ctrl+C to stop.".green());
    println!();

    // Show members periodically and handle Ctrl+C
    let report = async {
        let mut last_version = 0;
        loop {
            tokio::time::sleep(cycle * 2).await;

            let members = node.nodes();
            println!("{}", format!("Cluster members ({}):", members.len()).bright_black());
            for member in &members {
                let marker = if member.same_peer(node.local()) { "*".green() } else { "*".cyan() };
                println!("  {} {}", marker, member);
            }

            let metadata = node.metadata();
            if metadata.update != last_version {
                last_version = metadata.update;
                println!(
                    "  {} {}",
                    "Metadata:".bright_white(),
                    String::from_utf8_lossy(&metadata.data)
                );
            }
            println!();
        }
    };

    tokio::select! {
        _ = report => {}
        _ = signal::ctrl_c() => {
            println!();
            println!("{}", "Shutting down...".yellow());
        }
    }

    node.shutdown().await.context("Failed to stop node")?;
    println!("{}", "Node stopped.".green());

    Ok(())
}
