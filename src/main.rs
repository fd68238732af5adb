//! hab-connect daemon
//!
//! Keeps a resolved connection to the openHAB server while the network comes
//! and goes. Words given on the command line are relayed as a voice command.

use hab_connect::bus::{BusEvent, SharedBus};
use hab_connect::config;
use hab_connect::context::AppContext;
use hab_connect::network::{spawn_poller, NetworkProbe, RouteProbe};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hab_connect=debug,reqwest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting hab-connect v{} ({})",
        env!("HAB_VERSION"),
        env!("HAB_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    let probe_addr: SocketAddr = config
        .network
        .probe_addr
        .parse()
        .with_context(|| format!("invalid network.probe_addr {:?}", config.network.probe_addr))?;

    let probe = Arc::new(RouteProbe::new(probe_addr, config.network.interface));
    let initial = probe.probe().await;

    let mut ctx = AppContext::start(config.connection.clone(), initial);

    let poller = spawn_poller(
        probe,
        ctx.monitor.clone(),
        config.network.poll_interval(),
        ctx.shutdown_token(),
    );
    ctx.track(poller);
    ctx.track(spawn_notice_log(ctx.bus.clone(), ctx.shutdown_token()));

    let words: Vec<String> = std::env::args().skip(1).collect();
    if !words.is_empty() {
        let transcript = words.join(" ");
        let dispatch = ctx.voice.submit(1, &[transcript]).await;
        tracing::info!(?dispatch, "Voice command submitted");
    }

    shutdown_signal().await;
    ctx.shutdown().await;

    Ok(())
}

/// Stand-in for the UI layer: user notices end up in the log
fn spawn_notice_log(bus: SharedBus, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(BusEvent::UserNotice { message }) => tracing::info!("{}", message),
                    Ok(BusEvent::VoiceRequestFinished { request_id, success }) => {
                        tracing::info!(request_id, success, "Voice request finished");
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
