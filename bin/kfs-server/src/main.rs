//! KFS Server
//!
//! Accepts uploads over HTTP and stores them, deduplicated and replicated,
//! across the configured disks.

use anyhow::{Context, Result};
use clap::Parser;
use kfs_common::{Config, HashAlgorithm};
use kfs_server::{AppState, bootstrap, router};
use kfs_storage::StatvfsProbe;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kfs-server")]
#[command(about = "KFS content-addressed, disk-redundant file store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "KFS_CONFIG", default_value = "/etc/kfs/kfs.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, env = "KFS_LISTEN")]
    listen: Option<SocketAddr>,

    /// Disk roots to store replicas on (comma separated or repeated)
    #[arg(long, env = "KFS_DISKS", value_delimiter = ',')]
    disks: Vec<PathBuf>,

    /// Path of the metadata database
    #[arg(long, env = "KFS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Replicas per unique file
    #[arg(short, long, env = "KFS_REDUNDANCY")]
    redundancy: Option<usize>,

    /// Content hash algorithm (blake2b or sha256)
    #[arg(long, env = "KFS_HASH_ALGORITHM")]
    hash_algorithm: Option<HashAlgorithm>,

    /// Log level
    #[arg(long, env = "KFS_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file if it exists, then apply command line overrides
    fn load_config(&self) -> Result<Config> {
        let mut config: Config = if self.config.exists() {
            let text = std::fs::read_to_string(&self.config)
                .with_context(|| format!("reading {}", self.config.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing {}", self.config.display()))?
        } else {
            Config::default()
        };

        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if !self.disks.is_empty() {
            config.storage.disks.clone_from(&self.disks);
        }
        if let Some(db_path) = &self.db_path {
            config.metadata.db_path.clone_from(db_path);
        }
        if let Some(redundancy) = self.redundancy {
            config.storage.redundancy = redundancy;
        }
        if let Some(algorithm) = self.hash_algorithm {
            config.storage.hash_algorithm = algorithm;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting KFS server v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());
    info!("Disks: {:?}", config.storage.disks);
    info!(
        "Redundancy: {}, hash algorithm: {}",
        config.storage.redundancy, config.storage.hash_algorithm
    );

    config.validate()?;

    let ingestor = bootstrap(&config, Arc::new(StatvfsProbe)).await?;
    let state = Arc::new(AppState {
        ingestor: Arc::new(ingestor),
    });
    let app = router(state, config.server.max_upload_bytes);

    info!("Listening on {}", config.server.listen);
    let listener = TcpListener::bind(config.server.listen).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("KFS server shut down gracefully");

    Ok(())
}
