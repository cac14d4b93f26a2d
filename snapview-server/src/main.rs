//! snapview: materialized-view snapshot server.
//!
//! Configuration comes from flags or `SNAPVIEW_*` environment variables;
//! log filtering from `RUST_LOG`.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use snapview_server::{ServerConfig, SnapshotServer};

#[derive(Parser)]
#[command(name = "snapview")]
#[command(about = "Serves consistent snapshots of event-sourced collections")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SNAPVIEW_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,
    /// Directory holding one database per collection
    #[arg(long, env = "SNAPVIEW_DATA_DIR", default_value = "snapview_data")]
    data_dir: PathBuf,
    /// Records per snapshot packet
    #[arg(long, env = "SNAPVIEW_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: usize,
    /// Packets buffered per snapshot stream
    #[arg(long, default_value_t = 4)]
    stream_buffer: usize,
    /// Deliveries buffered ahead of ingestion
    #[arg(long, default_value_t = 1024)]
    ingest_buffer: usize,
    /// Skip fsync on every commit
    #[arg(long)]
    no_sync: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            data_dir: self.data_dir,
            chunk_size: self.chunk_size,
            stream_buffer: self.stream_buffer,
            ingest_buffer: self.ingest_buffer,
            sync_writes: !self.no_sync,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let config = Cli::parse().into_config();

    info!(
        "Starting snapview on {} with data in {}",
        config.bind_addr,
        config.data_dir.display()
    );
    let server = SnapshotServer::new(config);
    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("snapview stopped");
    Ok(())
}
