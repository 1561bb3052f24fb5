mod operations;

use anyhow::{Context, bail};
use nb_common::{BootConfig, EventBus, ServiceHandle};
use nb_dhcp::SharedLeases;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,netboot=debug")),
        )
        .init();

    info!("Netboot starting...");

    let config_path = operations::config_path(
        std::env::args().nth(1),
        std::env::var("NETBOOT_CONFIG").ok(),
    );
    let mut config = BootConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.autoconfigure();
    config.validate()?;
    let config = Arc::new(config);

    info!(
        "Config loaded from {}: address {}, DHCP {}, TFTP {}",
        config_path.display(),
        config.network_address,
        if config.dhcp_enabled { "enabled" } else { "disabled" },
        if config.tftp_enabled { "enabled" } else { "disabled" },
    );

    let events = Arc::new(EventBus::new());
    operations::spawn_event_log(&events);

    // ── Start services ─────────────────────────────────────────────────

    let mut dhcp: Option<ServiceHandle> = None;
    let mut leases: Option<SharedLeases> = None;
    if config.dhcp_enabled {
        let (handle, table) = nb_dhcp::server::start(config.clone(), events.clone())
            .await
            .context("starting DHCP service")?;
        dhcp = Some(handle);
        leases = Some(table);
    }

    let mut tftp: Option<ServiceHandle> = None;
    if config.tftp_enabled {
        match nb_tftp::server::start(config.clone(), events.clone()).await {
            Ok(handle) => tftp = Some(handle),
            Err(e) => {
                stop_all([dhcp.take()]).await;
                return Err(e).context("starting TFTP service");
            }
        }
    }

    info!("Netboot started successfully");

    // ── Operational signals ────────────────────────────────────────────

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGHUP])?;
    let handle = signals.handle();

    let failed = loop {
        tokio::select! {
            signal = signals.next() => match signal {
                Some(SIGUSR1) => operations::dump_leases(leases.as_ref()).await,
                Some(SIGHUP) => operations::save_config(&config, &config_path),
                Some(SIGINT) | Some(SIGTERM) => {
                    info!("Shutting down...");
                    break None;
                }
                Some(other) => warn!("Ignoring signal {}", other),
                None => break None,
            },
            _ = stopped(&mut dhcp) => break Some("dhcp"),
            _ = stopped(&mut tftp) => break Some("tftp"),
        }
    };

    handle.close();
    stop_all([dhcp, tftp]).await;

    if let Some(service) = failed {
        bail!("{} service terminated unexpectedly", service);
    }
    info!("Netboot stopped");
    Ok(())
}

/// Resolves when the service stops; never for a disabled one.
async fn stopped(handle: &mut Option<ServiceHandle>) {
    match handle {
        Some(handle) => handle.stopped().await,
        None => std::future::pending().await,
    }
}

async fn stop_all<const N: usize>(handles: [Option<ServiceHandle>; N]) {
    for handle in handles.into_iter().flatten() {
        let name = handle.name().to_string();
        if let Err(e) = handle.shutdown().await {
            error!("Failed to stop {}: {}", name, e);
        }
    }
}
