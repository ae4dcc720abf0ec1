//! `lpxcast` server binary: loads configuration and scan tables,
//! starts the broadcast server, and blocks until terminated.
//!
//! Process supervision and signal handling are external collaborators
//! (see spec §1); this binary's only lifecycle concern is standing the
//! server up and tearing it down cleanly via `BroadcastServer::stop`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use lpxcast::config::ServerConfig;
use lpxcast::error::AppResult;
use lpxcast::scan::ScanEngine;
use lpxcast::server::BroadcastServer;
use lpxcast::source::SyntheticFrameSource;
use lpxcast::tables::ScanTables;

#[cfg(feature = "video_ffmpeg")]
use lpxcast::source::FfmpegFrameSource;

fn main() -> AppResult<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "lpxcast.toml".to_string());
    let config = ServerConfig::load_from(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    tracing::info!(config_path, "loaded configuration");

    let tables = Arc::new(ScanTables::load(&config.scan_tables_path)?);
    tracing::info!(
        map_width = tables.map_width(),
        spiral_period = tables.spiral_period(),
        total_cells = tables.total_cells(),
        "loaded scan tables"
    );

    let scan_engine = Arc::new(ScanEngine::new(tables.clone())?);

    #[cfg(feature = "video_ffmpeg")]
    let source: Box<dyn lpxcast::source::FrameSource> =
        match FfmpegFrameSource::open(&config.video_file_path) {
            Ok(source) => Box::new(source),
            Err(e) => return Err(e),
        };
    #[cfg(not(feature = "video_ffmpeg"))]
    tracing::warn!(
        video_file_path = %config.video_file_path.display(),
        "built without the `video_ffmpeg` feature; serving a synthetic test pattern instead"
    );
    #[cfg(not(feature = "video_ffmpeg"))]
    let source: Box<dyn lpxcast::source::FrameSource> = Box::new(SyntheticFrameSource::new(
        config.output_width,
        config.output_height,
        if config.target_fps > 0.0 { config.target_fps } else { 30.0 },
        u64::MAX,
    ));

    let server = BroadcastServer::start(&config, tables, scan_engine, source)?;
    tracing::info!(port = config.port, "broadcast server running");

    // Process supervision is external (spec §1); park here until the
    // process is killed, running the server's threads in the background.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
        if server.client_count() == 0 {
            tracing::debug!("no clients connected");
        }
    }
}
