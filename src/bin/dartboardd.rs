//! dartboardd - dartboard capture daemon
//!
//! This daemon:
//! 1. Loads configuration (file + DARTBOARD_* environment)
//! 2. Opens the throw database and the persisted board calibration
//! 3. Builds the capture controller for the configured frame source
//! 4. Serves the local HTTP API until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use dartboard_capture::{
    api::{ApiConfig, ApiServer, ApiState},
    calibration::JsonFileCalibrationStore,
    config::DartboardConfig,
    ingest::source_factory,
    BoardCalibrator, CaptureController, SourceKind, SqliteThrowStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension). Overrides DARTBOARD_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Frame source backend: "stub" or "v4l2".
    #[arg(long, env = "DARTBOARD_FRAME_SOURCE")]
    frame_source: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DartboardConfig::load_from(path)?,
        None => DartboardConfig::load()?,
    };
    let source_kind = match &args.frame_source {
        Some(value) => SourceKind::parse(value)?,
        None => config.source_kind()?,
    };

    let store = Arc::new(SqliteThrowStore::open(&config.db_path)?);
    let calibration_store = Arc::new(JsonFileCalibrationStore::new(&config.calibration.path));
    let calibrator = Arc::new(BoardCalibrator::load(
        calibration_store,
        config.calibration.target_size,
    ));
    let sources = source_factory(source_kind, config.capture.width, config.capture.height)?;
    let controller = Arc::new(CaptureController::new(
        sources,
        store.clone(),
        calibrator,
        config.capture_settings(),
    ));

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        ApiState {
            controller: controller.clone(),
            store,
        },
    )
    .spawn()?;
    log::info!(
        "dartboardd running. db={} calibration={} source={} api={}",
        config.db_path,
        config.calibration.path.display(),
        source_kind.as_str(),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("dartboardd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture and API server...");
    let status = controller.stop();
    log::info!(
        "capture stopped: frames_processed={} throws_detected={}",
        status.frames_processed,
        status.throws_detected
    );
    api_handle.stop()?;

    Ok(())
}
