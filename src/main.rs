use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scion_multiping::cli::Args;
use scion_multiping::config::{self, Config};
use scion_multiping::export::{run_daily_rotation, SqliteExporter};
use scion_multiping::host::HostContext;
use scion_multiping::probe::IpPinger;
use scion_multiping::prober::{run_ip_loop, PathProber, ProberConfig};
use scion_multiping::remotes::Remotes;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env().context("invalid configuration")?;
    config::init_logging(&config.log_level)?;

    // The remotes file takes precedence over the CLI list.
    let remotes = if config.remotes_file.exists() {
        Remotes::load(&config.remotes_file)?
    } else if let Some(ref list) = args.destinations {
        Remotes::from_cli_list(list)
    } else {
        bail!(
            "no destinations: provide {} or a destination list argument",
            config.remotes_file.display()
        );
    };
    let scion_destinations = remotes.parse_scion()?;
    let ip_destinations = remotes.parse_ip()?;
    if scion_destinations.is_empty() && ip_destinations.is_empty() {
        bail!("destination list is empty");
    }
    info!(
        scion = scion_destinations.len(),
        ip = ip_destinations.len(),
        "loaded destinations"
    );

    let host = Arc::new(
        HostContext::connect(&config.daemon_address)
            .await
            .context("SCION host context initialization failed")?,
    );
    let exporter = Arc::new(SqliteExporter::new(&config.db_path, config.batch_size));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let prober = PathProber::init(
        host,
        exporter.clone(),
        scion_destinations,
        ProberConfig::default(),
        cancel.clone(),
    )
    .await
    .context("prober initialization failed")?;

    let mut handles = Vec::new();
    handles.push(tokio::spawn(prober.clone().run_sweep_loop()));
    handles.push(tokio::spawn(prober.run_fast_loop()));
    handles.push(tokio::spawn(run_daily_rotation(
        exporter.clone(),
        cancel.clone(),
    )));

    if !ip_destinations.is_empty() {
        // The IP side is optional: without CAP_NET_RAW the SCION probing
        // still runs.
        match IpPinger::new(cancel.clone()) {
            Ok(pinger) => handles.push(tokio::spawn(run_ip_loop(
                pinger,
                ip_destinations,
                exporter.clone(),
                cancel.clone(),
            ))),
            Err(e) => warn!(error = %e, "IP pinger disabled"),
        }
    }

    cancel.cancelled().await;
    info!("shutting down");
    for handle in handles {
        let _ = handle.await;
    }
    if let Err(e) = exporter.close() {
        error!(error = %e, "final exporter flush failed");
    }

    Ok(())
}

/// Cancel everything on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "no SIGTERM handler; relying on ctrl-c");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        info!("termination signal received");
        cancel.cancel();
    });
}
