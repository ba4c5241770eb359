mod cache;
mod config;
mod metrics;
mod plug;
mod poller;
mod web;

#[cfg(test)]
mod testutil;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info};

use crate::cache::TelemetryCache;
use crate::plug::client::PlugClient;
use crate::poller::Poller;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = match metrics::Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting plug-metrics (port={}, devices={}, poll every {}s)",
        config.http.port,
        config.devices.len(),
        config.poll.interval_secs,
    );

    let cache = TelemetryCache::new();

    // One poller per plug; they share nothing but the cache and the metrics.
    let mut device_handles = Vec::new();
    for endpoint in &config.devices {
        info!("  Plug at {}", endpoint);
        let client = Arc::new(PlugClient::new(endpoint.clone()));
        let poller = Poller::new(
            client,
            cache.clone(),
            Arc::clone(&metrics),
            config.poll_interval(),
        );
        device_handles.push(tokio::spawn(poller.run()));
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http.port));
    let state = web::AppState {
        cache,
        metrics,
        heartbeat: config.heartbeat_interval(),
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut http_handle = tokio::spawn(async move {
        info!("Listening on {}", addr);
        web::serve(addr, state, async move {
            let _ = shutdown_rx.await;
        })
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        () = sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
        res = &mut http_handle => {
            match res {
                Ok(Ok(())) => info!("HTTP server stopped"),
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
            for handle in &device_handles {
                handle.abort();
            }
            std::process::exit(1);
        }
    }

    // Cleanup
    for handle in device_handles {
        handle.abort();
    }
    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = http_handle.await {
        error!("HTTP server error during shutdown: {}", e);
    }
    info!("plug-metrics stopped");
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
