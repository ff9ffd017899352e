use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use peer_link::{
    InboundRequest, LocalRelayHub, ManagerConfig, PeerManager, RequestHandlers, RtcConnector,
    Transport,
};
use serde_json::json;
use tokio::time::{Instant, sleep};
use tracing::{Level, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peer-link-demo")]
#[command(about = "Spin up an in-process mesh of peers and exchange requests across it")]
struct Cli {
    /// Number of peers to start
    #[arg(short, long, default_value_t = 3, env = "PEER_LINK_DEMO_PEERS")]
    peers: usize,

    /// Room name on the in-memory relay
    #[arg(long, default_value = "demo", env = "PEER_LINK_DEMO_ROOM")]
    room: String,

    /// STUN/TURN urls; none means host candidates only
    #[arg(long = "ice-server", env = "PEER_LINK_DEMO_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Seconds to wait for every pair to connect
    #[arg(long, default_value_t = 20)]
    connect_timeout: u64,

    /// Log every relayed envelope at debug
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    if cli.peers < 2 {
        bail!("a mesh needs at least two peers, got {}", cli.peers);
    }

    let hub = LocalRelayHub::new();
    let room = hub.room(&cli.room);
    let config = ManagerConfig {
        verbose: cli.verbose,
        ..ManagerConfig::from_env()
    };

    let mut managers = Vec::with_capacity(cli.peers);
    for _ in 0..cli.peers {
        let local_id = uuid::Uuid::new_v4().to_string();
        let connector = RtcConnector::new(cli.ice_servers.clone())
            .context("failed to build webrtc api")?;
        let manager = PeerManager::builder(&local_id)
            .config(config.clone())
            .handlers(demo_handlers(local_id.clone()))
            .spawn(Arc::new(room.clone()), Arc::new(connector));
        manager.follow(room.subscribe());
        managers.push(manager);
    }

    for manager in &managers {
        manager.start();
    }
    wait_for_mesh(&managers, Duration::from_secs(cli.connect_timeout)).await?;

    for caller in &managers {
        for peer_id in caller.connected_client_ids().await {
            let started = Instant::now();
            match caller
                .request_client(&peer_id, "ping", json!({ "sent": "hello" }), Transport::Auto)
                .await
            {
                Ok(reply) => info!(
                    from = %caller.local_id(),
                    to = %peer_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    %reply,
                    "ping answered"
                ),
                Err(err) => warn!(from = %caller.local_id(), to = %peer_id, error = %err, "ping failed"),
            }
        }
    }

    if let Some(first) = managers.first() {
        first.notify_all_clients("bye", json!({ "from": first.local_id() }), Transport::Relay);
    }
    sleep(Duration::from_millis(200)).await;
    for manager in &managers {
        manager.stop();
    }
    sleep(Duration::from_millis(200)).await;
    info!("demo finished");
    Ok(())
}

fn demo_handlers(local_id: String) -> RequestHandlers {
    RequestHandlers::new().with("ping", move |request: InboundRequest| {
        let local_id = local_id.clone();
        async move {
            Ok(json!({
                "pong": local_id,
                "caller": request.from_client_id,
                "echo": request.payload,
            }))
        }
    })
}

async fn wait_for_mesh(managers: &[PeerManager], limit: Duration) -> anyhow::Result<()> {
    let expected = managers.len() - 1;
    let deadline = Instant::now() + limit;
    loop {
        let mut ready = 0;
        for manager in managers {
            if manager.connected_client_ids().await.len() == expected {
                ready += 1;
            }
        }
        if ready == managers.len() {
            info!(peers = managers.len(), "mesh connected");
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("only {ready} of {} peers fully connected after {limit:?}", managers.len());
        }
        sleep(Duration::from_millis(250)).await;
    }
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
