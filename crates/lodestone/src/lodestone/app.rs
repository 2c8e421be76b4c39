use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::lodestone::{admin, config, logging, net, proxy, routes, telemetry};

pub async fn run(opts: config::Options) -> anyhow::Result<()> {
    let cfg = config::load(&opts)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        listen_addr = %cfg.listen_addr,
        api_binding = %cfg.api_binding,
        mappings = cfg.mappings.len(),
        default_route = %cfg.default_route,
        "lodestone: starting"
    );

    let metrics: telemetry::SharedMetrics = Arc::new(telemetry::MetricsCollector::new());
    let sessions: telemetry::SharedSessions = Arc::new(telemetry::SessionRegistry::new());

    let route_table = Arc::new(routes::RouteTable::new());
    for (host, endpoint) in &cfg.mappings {
        route_table.create_mapping(host, endpoint);
    }
    if !cfg.default_route.is_empty() {
        route_table.set_default_route(&cfg.default_route);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Management API.
    if !cfg.api_binding.is_empty() {
        let api_addr = net::normalize_bind_addr(&cfg.api_binding);
        let addr: SocketAddr = api_addr
            .parse()
            .with_context(|| format!("invalid api_binding: {}", cfg.api_binding))?;

        let state = admin::AdminState {
            metrics: metrics.clone(),
            sessions: sessions.clone(),
            routes: route_table.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Minecraft listener.
    {
        let handler = Arc::new(proxy::ConnectionOptions {
            routes: route_table.clone(),
            metrics: metrics.clone(),
            sessions: sessions.clone(),
            handshake_timeout: cfg.timeouts.handshake,
            dial_timeout: cfg.timeouts.dial,
            shutdown_grace: cfg.timeouts.shutdown_grace,
            buffer_size: cfg.buffer_size,
        });
        let listen_addr = cfg.listen_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(
            async move { proxy::serve_with_shutdown(&listen_addr, handler, shutdown).await },
        );
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; only enforce the hard cap if something hangs past the
    // listener's own grace period.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    let drain_timeout = cfg.timeouts.shutdown_grace + Duration::from_secs(1);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
