use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetrackd starting");

    let config = config::Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        models = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.tracker.match_threshold,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(config)
        .await
        .context("engine failed to start")?;

    let service = dbus_interface::TrackerService {
        engine: engine.clone(),
    };
    let _conn = zbus::connection::Builder::session()?
        .name("org.facetrack.Tracker1")?
        .serve_at("/org/facetrack/Tracker1", service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!("facetrackd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetrackd shutting down");
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine did not shut down cleanly");
    }

    Ok(())
}
