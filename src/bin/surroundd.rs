//! surroundd - multi-camera detection relay
//!
//! This daemon:
//! 1. Loads the stream list and timings (file, then SURROUND_* env)
//! 2. Starts one detection worker per camera stream
//! 3. Serves the latest detections on GET /detections
//! 4. Stops the API and every worker on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use surround_detect::{
    api::{ApiConfig, ApiServer, QueryService},
    BackendRegistry, DetectionStore, Supervisor, SurroundConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve live object detections from several camera streams")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "SURROUND_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for the query API (overrides config and SURROUND_API_ADDR).
    #[arg(long)]
    api_addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = SurroundConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }

    let registry = BackendRegistry::from_settings(&cfg.detector)?;
    let detector = registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    detector
        .warm_up()
        .with_context(|| format!("warm up detector '{}'", detector.name()))?;
    log::info!(
        "detector '{}' ready (available: {})",
        detector.name(),
        registry.list().join(", ")
    );

    let store = Arc::new(DetectionStore::new(cfg.stream_ids())?);
    for stream in &cfg.streams {
        log::info!("stream {} -> {}", stream.id, stream.url);
    }

    let supervisor = Supervisor::new(
        cfg.stream_specs(),
        store.clone(),
        detector,
        cfg.supervisor_settings(),
    )
    .start()?;

    let query = QueryService::new(store).with_stats(supervisor.stats().to_vec());
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        query,
    )
    .spawn()?;
    log::info!("query api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("set Ctrl-C handler")?;

    log::info!("surroundd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server and stream workers...");
    api_handle.stop()?;
    supervisor.stop()?;

    Ok(())
}
