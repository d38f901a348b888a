use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod pipeline;
mod runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mirrord starting");

    let config = config::Config::from_env();
    let mirror = runtime::Mirror::start(config).await?;
    let camera_failed = mirror.camera_failure();
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupted");
        }
        _ = sigterm.recv() => tracing::info!("terminated"),
        _ = camera_failed.cancelled() => tracing::error!("camera stopped delivering frames"),
    }

    let last = mirror.status();
    tracing::info!(
        presence = ?last.presence,
        visible = last.widgets.iter().filter(|w| w.visible).count(),
        "mirrord shutting down"
    );
    mirror.stop().await
}
