use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use swapline_core::config::NodeConfig;
use swapline_core::node::SwapNode;
use swapline_core::telemetry::{self, LogConfig, LogLevel};
use swapline_core::transport::manager::ManagerEventKind;
use swapline_core::transport::{ManagerEvent, PeerId};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "swapline", version, about = "Peer-to-peer asset swap node")]
struct Cli {
    #[arg(long, global = true, env = "SWAPLINE_SIGNALING_URL")]
    signaling_url: Option<String>,

    #[arg(long, global = true, env = "SWAPLINE_PEER_ID")]
    peer_id: Option<String>,

    #[arg(long, global = true, help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay online and accept incoming connections until interrupted.
    Listen,
    /// Open a data channel to a peer and report connection health.
    Connect {
        peer: String,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = NodeConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if let Some(peer_id) = cli.peer_id {
        config.peer_id = Some(peer_id);
    }

    let node = SwapNode::start(config).await.context("starting node")?;
    println!("peer id: {}", node.peer_id());

    let outcome = match cli.command {
        Command::Listen => listen(&node).await,
        Command::Connect { peer, wait_secs } => connect(&node, PeerId::new(peer), Duration::from_secs(wait_secs)).await,
    };
    node.shutdown().await;
    outcome
}

async fn listen(node: &SwapNode) -> Result<()> {
    let mut events = node.manager().subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                info!(target = "swapline::cli", "interrupted");
                return Ok(());
            }
            event = events.next() => match event {
                Some(event) => println!("{event:?}"),
                None => return Ok(()),
            },
        }
    }
}

async fn connect(node: &SwapNode, peer: PeerId, wait: Duration) -> Result<()> {
    let mut connected = node.manager().subscribe_kind(ManagerEventKind::PeerConnected);
    node.connect(&peer).await.with_context(|| format!("connecting to {peer}"))?;

    let reached = tokio::time::timeout(wait, async {
        while let Some(event) = connected.next().await {
            if matches!(&event, ManagerEvent::PeerConnected { peer: id } if id == &peer) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    println!("{}", serde_json::to_string_pretty(&node.manager().health())?);
    if !reached {
        bail!("{peer} did not connect within {}s", wait.as_secs());
    }
    Ok(())
}
