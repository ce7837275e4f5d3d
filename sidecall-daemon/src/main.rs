// SideCall daemon: LAN peer link + notification relay coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sidecall_daemon::{config, coordinator, lan, notify};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("sidecall-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let username = cfg
        .username
        .clone()
        .context("pairing username missing; set `username` in the config file")?;
    let pin = cfg
        .pin
        .clone()
        .context("pairing pin missing; set `pin` in the config file")?;
    let channel_id = sidecall_core::derive_channel_id(&username, &pin)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport =
            lan::LanTransport::bind(events_tx, cfg.discovery_port, cfg.transport_port).await?;
        let handle = coordinator::spawn(
            transport,
            events_rx,
            Arc::new(notify::LogDispatch),
            Arc::new(notify::NoContacts),
        );
        handle.start(&channel_id, config::resolve_device_name(&cfg));

        shutdown_signal().await?;
        handle.stop();
        // Give the stop commands a moment to reach the transport before the
        // runtime goes away.
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, tasks exit with the runtime.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
