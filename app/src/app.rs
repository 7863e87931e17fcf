use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::sync::PeerSync;
use crate::testing::mocks::{MemChain, MockMemPool, TestNet};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "WEAVE sync node", long_about = None)]
pub struct App {
    /// Logical network to join; namespaces all sync topics.
    #[arg(long, default_value = "main")]
    pub network: String,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    /// Blocks the seeded dev peer starts ahead by.
    #[arg(long, default_value_t = 64)]
    pub dev_blocks: u64,

    /// Target block interval in seconds.
    #[arg(long)]
    pub block_interval: Option<u64>,

    /// Disable the background consistency audit.
    #[arg(long, default_value_t = false)]
    pub no_audit: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap();

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("app={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    /// Run two in-process nodes over the loopback transport: a seeded peer
    /// holding `dev_blocks` extra blocks and a follower that syncs from it.
    /// Real deployments embed the engine as a library behind their own
    /// transport; this binary exists to exercise the full protocol path.
    async fn execute(self) -> Result<()> {
        let mut config = NodeConfig::default();
        config.network = self.network;
        if let Some(secs) = self.block_interval {
            config.relay.block_interval = Duration::from_secs(secs);
        }
        config.audit.enabled = !self.no_audit;
        config.validate()?;

        let net = TestNet::new();

        let seed_chain = MemChain::with_blocks(self.dev_blocks);
        let seed_id = crate::testing::mocks::random_peer_id();
        let seed = PeerSync::new(
            config.clone(),
            seed_chain.clone(),
            MockMemPool::new(),
            net.transport(seed_id),
        );
        seed.start();

        let follower_chain = MemChain::new();
        let follower_id = crate::testing::mocks::random_peer_id();
        let follower = PeerSync::new(
            config,
            follower_chain.clone(),
            MockMemPool::new(),
            net.transport(follower_id),
        );
        follower.start();

        info!(
            %seed_id,
            %follower_id,
            genesis = %hex::encode(seed_chain.genesis_hash()),
            "dev nodes started"
        );
        net.connect(follower_id, seed_id);

        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let best = follower_chain.best_snapshot().await;
            if follower.is_current().await {
                info!(
                    total = best.total,
                    height = best.height,
                    "follower is current"
                );
                let snapshots = follower.peers().snapshots().await;
                debug!(
                    peers = %serde_json::to_string(&snapshots).unwrap_or_default(),
                    "peer summary"
                );
                break;
            }
            info!(total = best.total, "syncing...");
        }

        // Keep serving until a shutdown is signalled (ctrl-c or a failed
        // consistency audit).
        let mut shutdown = follower.shutdown_listener();
        loop {
            shutdown.changed().await.ok();
            if *shutdown.borrow() {
                break;
            }
        }
        Ok(())
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
