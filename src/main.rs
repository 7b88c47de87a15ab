//! Quartermaster shard daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! quartermaster
//!
//! # Start with custom config
//! quartermaster --config /path/to/config.toml
//!
//! # Second shard sharing the same store
//! QM_SHARD_ID=1 quartermaster --http-port 8096 --storage-dir /data/qm
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health` - Health check
//! - `POST /shard/search` - Local project search for peer shards
//! - `GET /shard/stats` - Local community and project counts
//! - `POST /command` - Run a command document

use anyhow::Context;
use clap::Parser;
use quartermaster::chat::ChatAdapter;
use quartermaster::services::spawn_logging_listener;
use quartermaster::{
    Config, DeadlineScheduler, EventBus, GatewayChatAdapter, HttpServer, HttpShardPeer,
    LocalShard, LogChatAdapter, Notifier, RecipeCatalog, SchedulerConfig, Services,
    ShardAggregator, ShardPeer, TrackerDb,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quartermaster")]
#[command(about = "Project resource tracker for sharded chat agents")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP port for shard RPC and commands
    #[arg(long)]
    http_port: Option<u16>,

    /// Id of this shard process
    #[arg(long, env = "QM_SHARD_ID")]
    shard_id: Option<u32>,

    /// Directory holding the recipe catalog JSON files
    #[arg(long, env = "QM_CATALOG_DIR")]
    catalog_dir: Option<PathBuf>,

    /// Chat gateway base URL
    #[arg(long, env = "CHAT_GATEWAY_URL")]
    chat_gateway_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("quartermaster=info".parse()?);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(id) = args.shard_id {
        config.shard_id = id;
    }
    if let Some(dir) = args.catalog_dir {
        config.catalog_dir = dir;
    }
    if args.chat_gateway_url.is_some() {
        config.chat_gateway_url = args.chat_gateway_url;
    }
    config.log_json |= args.log_json;
    config.validate()?;

    init_tracing(config.log_json)?;

    info!(
        shard_id = config.shard_id,
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        peers = config.peers.len(),
        "Starting quartermaster"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(TrackerDb::open(&config.database_path())?);
    let catalog = Arc::new(RecipeCatalog::load(&config.catalog_dir)?);
    info!(
        items = catalog.item_count(),
        recipes = catalog.recipe_count(),
        "Recipe catalog loaded"
    );

    let chat: Arc<dyn ChatAdapter> = match &config.chat_gateway_url {
        Some(url) => {
            info!(url = %url, "Using chat gateway");
            Arc::new(GatewayChatAdapter::new(url.clone(), config.delivery_timeout())?)
        }
        None => {
            warn!("No chat gateway configured, messages will only be logged");
            Arc::new(LogChatAdapter)
        }
    };

    let events = Arc::new(EventBus::new());
    let listener_handle = spawn_logging_listener(events.clone());

    // Scatter-gather peers: this process first, then the configured shards
    let local = Arc::new(LocalShard::new(config.shard_id, db.clone(), chat.clone()));
    let mut peers: Vec<Arc<dyn ShardPeer>> = vec![local.clone()];
    for peer in &config.peers {
        peers.push(Arc::new(HttpShardPeer::new(
            peer.shard_id,
            peer.url.clone(),
            config.shard_timeout(),
        )?));
    }
    let shards = Arc::new(ShardAggregator::new(peers, config.shard_timeout()));

    let notifier = Arc::new(Notifier::new(db.clone(), chat.clone()));
    let services = Arc::new(Services::new(
        db.clone(),
        catalog,
        notifier.clone(),
        shards,
        events,
    ));

    // Deadline reminders
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let scheduler = Arc::new(DeadlineScheduler::new(
        db.clone(),
        notifier,
        SchedulerConfig::from(&config),
    ));
    let scheduler_handle = scheduler.spawn(shutdown_rx);

    let http_addr: SocketAddr = format!("{}:{}", config.bind_host, config.http_port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind_host, config.http_port))?;
    let http_server = Arc::new(HttpServer::new(services, local, http_addr));

    info!("HTTP API available at http://{}", http_addr);

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Deadline scheduler task failed");
    }
    listener_handle.abort();

    // Spawned connection tasks may still hold handles; they see a closed store
    db.close()?;

    info!("Quartermaster stopped");
    Ok(())
}
