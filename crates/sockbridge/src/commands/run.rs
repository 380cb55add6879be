use std::path::PathBuf;
use std::sync::Arc;

use sockbridge_core::{BridgeEvent, BridgeServer};
use sockbridge_settings::{BridgeSettings, ConfigLoader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // --no-config skips global/project files but --config <extra> still applies.
    let settings = ConfigLoader::load_layered(
        &cwd,
        args.source.extra_config.as_deref(),
        !args.source.no_config,
    )?;
    let config = apply_overrides(settings, &args).to_bridge_config()?;

    let server = BridgeServer::new(config)?;
    let events = args.events.then(|| server.subscribe());
    let upstream = server.config().upstream_authority();
    let handle = server.start().await?;
    let registry = Arc::clone(handle.registry());

    eprintln!(
        "sockbridge: listening on {} -> upstream {upstream}",
        handle.local_addr()
    );

    let printer = events.map(|rx| tokio::spawn(print_events(rx)));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    handle.shutdown().await?;

    if let Some(printer) = printer {
        printer.abort();
    }

    let stats = registry.statistics();
    eprintln!(
        "sockbridge: {} sessions, {} bytes sent, {} bytes received",
        stats.total_sessions, stats.bytes_sent, stats.bytes_received
    );
    Ok(())
}

/// Layer command-line flags on top of file settings.
fn apply_overrides(mut settings: BridgeSettings, args: &RunArgs) -> BridgeSettings {
    if let Some(port) = args.port {
        settings.listener.port = Some(port);
    }
    if let Some((host, port)) = &args.upstream {
        settings.upstream.host = Some(host.clone());
        settings.upstream.port = Some(*port);
    }
    if let Some(max) = args.max_connections {
        settings.limits.max_connections = Some(max);
    }
    if let Some(idle) = args.idle_timeout {
        settings.limits.idle_timeout_secs = Some(idle);
    }
    if args.no_heartbeat {
        settings.heartbeat.enabled = Some(false);
    }
    if let Some(fingerprint) = &args.fingerprint {
        settings.listener.fingerprint = Some(fingerprint.clone());
    }
    settings
}

async fn print_events(mut rx: broadcast::Receiver<BridgeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
