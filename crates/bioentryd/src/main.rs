use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod capture;
mod client;
mod config;
mod connectivity;
mod dbus_interface;
mod dispatch;
mod presenter;
mod remote;
mod seal;
mod store;
mod sync;
mod terminal;
#[cfg(test)]
mod testing;

use bioentry_hw::ReplaySource;
use config::{BusKind, Config};
use dbus_interface::{TerminalService, BUS_NAME, OBJECT_PATH};
use remote::HttpRemote;
use store::OfflineStore;
use terminal::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bioentryd starting");

    let config = Config::load().context("failed to load configuration")?;

    let settings = config.store_settings();
    if !settings.sealer.is_sealing() {
        tracing::warn!("store.payload_secret not set; queued images are stored unsealed");
    }
    let store = OfflineStore::open(&config.store.db_path, settings).with_context(|| {
        format!("failed to open offline store {}", config.store.db_path.display())
    })?;
    let store = Arc::new(store);

    let Some(frame_dir) = config.capture.frame_dir.as_ref() else {
        bail!("capture.frame_dir is not set; no frame source available");
    };
    let source = ReplaySource::open(frame_dir, config.capture.target_fps)
        .with_context(|| format!("failed to open frame source {}", frame_dir.display()))?;
    let detector = source.detector();
    let info = source.info();
    tracing::info!(
        dir = %frame_dir.display(),
        frames = info.frames,
        width = info.width,
        height = info.height,
        "frame source ready"
    );

    let remote = Arc::new(HttpRemote::new(&config));
    let terminal = Terminal::start(&config, remote, store, Box::new(source), Box::new(detector))
        .context("failed to start terminal")?;

    let cancel = CancellationToken::new();
    let mut forwarder = None;
    // Held for the daemon's lifetime; dropping it releases the bus name.
    let _conn = if config.dbus.enabled {
        let builder = match config.dbus.bus {
            BusKind::System => zbus::connection::Builder::system()?,
            BusKind::Session => zbus::connection::Builder::session()?,
        };
        let conn = builder
            .name(BUS_NAME)?
            .serve_at(OBJECT_PATH, TerminalService::new(terminal.handle()))?
            .build()
            .await
            .context("failed to register on D-Bus")?;
        tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

        forwarder = Some(tokio::spawn(dbus_interface::forward_status(
            conn.clone(),
            terminal.handle(),
            cancel.clone(),
        )));
        Some(conn)
    } else {
        tracing::info!("D-Bus disabled");
        None
    };

    tracing::info!(terminal_id = %config.terminal.id, "bioentryd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("bioentryd shutting down");

    cancel.cancel();
    if let Some(forwarder) = forwarder {
        match forwarder.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "status forwarder failed"),
            Err(e) => tracing::warn!(error = %e, "status forwarder panicked"),
            Ok(Ok(())) => {}
        }
    }
    terminal.shutdown().await;

    Ok(())
}
