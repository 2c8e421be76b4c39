//! Accept loop and per-connection mediation: parse the handshake, resolve a
//! route, dial the backend, replay the consumed bytes and splice.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::watch,
    task::JoinSet,
    time,
};

use crate::lodestone::{
    config, handshake, net,
    routes::{self, RouteTable},
    telemetry,
};

#[derive(Clone)]
pub struct ConnectionOptions {
    pub routes: Arc<RouteTable>,
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub shutdown_grace: Duration,
    pub buffer_size: usize,
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    opts: Arc<ConnectionOptions>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ln = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;
    tracing::info!(listen_addr = %listen_addr, "proxy: listening");
    serve_listener(ln, opts, shutdown).await
}

/// Accepts until shutdown, one mediator task per connection. On shutdown the
/// listener stops accepting, active sessions get `shutdown_grace` to finish,
/// and stragglers are aborted (their sockets close with them).
pub async fn serve_listener(
    ln: TcpListener,
    opts: Arc<ConnectionOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut conns: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = ln.accept() => {
                let (conn, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "proxy: accept failed");
                        continue;
                    }
                };
                let o = opts.clone();
                conns.spawn(async move {
                    handle_connection(conn, peer, o).await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }

    drop(ln);
    if !conns.is_empty() {
        tracing::info!(active = conns.len(), "proxy: draining sessions");
    }
    let drain = async {
        while conns.join_next().await.is_some() {}
    };
    if time::timeout(opts.shutdown_grace, drain).await.is_err() {
        conns.abort_all();
        while conns.join_next().await.is_some() {}
    }

    Ok(())
}

async fn handle_connection(conn: TcpStream, peer: SocketAddr, opts: Arc<ConnectionOptions>) {
    opts.metrics.inc_active();
    let sid = telemetry::new_session_id();
    let client = peer.to_string();

    let mut reader = handshake::CaptureReader::new(conn);
    let intent =
        match time::timeout(opts.handshake_timeout, handshake::read_intent(&mut reader)).await {
            Ok(Ok(intent)) => intent,
            Ok(Err(err)) => {
                tracing::warn!(sid = %sid, client = %client, err = %err, "proxy: handshake parse failed");
                opts.metrics.inc_handshake_failure();
                close(reader.into_inner()).await;
                opts.metrics.dec_active();
                return;
            }
            Err(_) => {
                tracing::debug!(sid = %sid, client = %client, "proxy: handshake timed out");
                opts.metrics.inc_handshake_failure();
                close(reader.into_inner()).await;
                opts.metrics.dec_active();
                return;
            }
        };
    let conn = reader.into_inner();

    let host = routes::sanitize_host(&intent.server_address);
    let Some(endpoint) = opts.routes.resolve(&host) else {
        tracing::info!(sid = %sid, client = %client, host = %host, "proxy: no route for host");
        opts.metrics.inc_no_route();
        close(conn).await;
        opts.metrics.dec_active();
        return;
    };
    opts.metrics.add_route_hit(&host);

    let endpoint = net::ensure_port(&endpoint, config::DEFAULT_PORT);
    let mut backend = match time::timeout(opts.dial_timeout, TcpStream::connect(&endpoint)).await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            tracing::warn!(sid = %sid, client = %client, host = %host, backend = %endpoint, err = %err, "proxy: backend dial failed");
            opts.metrics.inc_dial_failure();
            close(conn).await;
            opts.metrics.dec_active();
            return;
        }
        Err(_) => {
            tracing::warn!(sid = %sid, client = %client, host = %host, backend = %endpoint, "proxy: backend dial timed out");
            opts.metrics.inc_dial_failure();
            close(conn).await;
            opts.metrics.dec_active();
            return;
        }
    };

    // The backend must see a handshake indistinguishable from a direct
    // connection, so the captured bytes go out before anything else.
    if let Err(err) = backend.write_all(&intent.raw).await {
        tracing::debug!(sid = %sid, err = %err, "proxy: replaying handshake to backend failed");
        close(conn).await;
        opts.metrics.dec_active();
        return;
    }

    opts.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: client.clone(),
        host: host.clone(),
        backend: endpoint.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    tracing::debug!(
        sid = %sid,
        client = %client,
        host = %host,
        backend = %endpoint,
        state = ?intent.next_state,
        "proxy: routed"
    );

    let result = splice(conn, backend, opts.buffer_size).await;

    opts.sessions.remove(&sid);
    opts.metrics.dec_active();

    match result {
        Ok((to_backend, to_client)) => {
            opts.metrics.add_bytes(to_backend, to_client);
            tracing::debug!(sid = %sid, to_backend, to_client, "proxy: session ended");
        }
        Err(err) => {
            tracing::debug!(sid = %sid, err = %err, "proxy: session ended with error");
        }
    }
}

async fn close(mut conn: TcpStream) {
    let _ = conn.shutdown().await;
}

/// Full-duplex splice, one task per direction. A direction that ends shuts
/// the peer's write side so an orderly EOF is observed there; the other
/// direction keeps flowing until it ends too, then both sockets drop.
async fn splice(
    client: TcpStream,
    backend: TcpStream,
    buffer_size: usize,
) -> std::io::Result<(u64, u64)> {
    let (client_r, client_w) = client.into_split();
    let (backend_r, backend_w) = backend.into_split();

    let to_backend = tokio::spawn(copy_direction(client_r, backend_w, buffer_size));
    let to_client = tokio::spawn(copy_direction(backend_r, client_w, buffer_size));

    let (to_backend, to_client) = tokio::join!(to_backend, to_client);
    let to_backend = to_backend.map_err(std::io::Error::other)??;
    let to_client = to_client.map_err(std::io::Error::other)??;
    Ok((to_backend, to_client))
}

async fn copy_direction(
    mut r: OwnedReadHalf,
    mut w: OwnedWriteHalf,
    buffer_size: usize,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; buffer_size];
    let mut total: u64 = 0;
    let result = loop {
        match r.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => match w.write_all(&buf[..n]).await {
                Ok(()) => total += n as u64,
                Err(err) => break Err(err),
            },
            Err(err) => break Err(err),
        }
    };
    // Half-close propagation, also on error paths.
    let _ = w.shutdown().await;
    result.map(|()| total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodestone::handshake::tests::{build_handshake, build_legacy_ping};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn options(routes: Arc<RouteTable>) -> Arc<ConnectionOptions> {
        Arc::new(ConnectionOptions {
            routes,
            metrics: Arc::new(telemetry::MetricsCollector::new()),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
            handshake_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
            buffer_size: 8 * 1024,
        })
    }

    async fn spawn_proxy(
        opts: Arc<ConnectionOptions>,
    ) -> (
        SocketAddr,
        watch::Sender<bool>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(serve_listener(ln, opts, rx));
        (addr, tx, handle)
    }

    /// Backend that reads everything the proxy forwards, then answers and
    /// closes. Returns the received bytes.
    fn sink_backend(
        ln: TcpListener,
        reply: &'static [u8],
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut conn, _) = ln.accept().await.unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).await.unwrap();
            conn.write_all(reply).await.unwrap();
            conn.shutdown().await.unwrap();
            received
        })
    }

    #[tokio::test]
    async fn modern_handshake_is_routed_and_replayed() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();
        let backend = sink_backend(backend_ln, b"PONG");

        let table = Arc::new(RouteTable::new());
        table.create_mapping("my.srv", &backend_addr.to_string());
        let opts = options(table);
        let metrics = opts.metrics.clone();
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(opts).await;

        let wire = build_handshake("my.srv", 25565, 764, 1);
        let mut sent = wire.clone();
        sent.extend_from_slice(b"status request follows");

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&sent).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"PONG");

        let received = time::timeout(TEST_TIMEOUT, backend).await.unwrap().unwrap();
        assert_eq!(received, sent);
        assert_eq!(metrics.snapshot().route_hits["my.srv"], 1);
    }

    #[tokio::test]
    async fn modern_login_falls_back_to_the_default_route() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();
        let backend = sink_backend(backend_ln, b"");

        let table = Arc::new(RouteTable::new());
        table.set_default_route(&backend_addr.to_string());
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(options(table)).await;

        let wire = build_handshake("foo", 25565, 763, 2);
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();

        let received = time::timeout(TEST_TIMEOUT, backend).await.unwrap().unwrap();
        assert_eq!(received, wire);
    }

    #[tokio::test]
    async fn legacy_ping_is_replayed_in_full() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();
        let backend = sink_backend(backend_ln, b"");

        let table = Arc::new(RouteTable::new());
        table.create_mapping("example", &backend_addr.to_string());
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(options(table)).await;

        let wire = build_legacy_ping("example", 25565, 0x4A);
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();

        let received = time::timeout(TEST_TIMEOUT, backend).await.unwrap().unwrap();
        assert_eq!(received, wire);
    }

    #[tokio::test]
    async fn no_route_closes_the_client_without_dialing() {
        let opts = options(Arc::new(RouteTable::new()));
        let metrics = opts.metrics.clone();
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(opts).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_handshake("ghost", 25565, 764, 1))
            .await
            .unwrap();

        let mut reply = Vec::new();
        time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(metrics.snapshot().no_route, 1);
        assert_eq!(metrics.snapshot().dial_failures, 0);
    }

    #[tokio::test]
    async fn dial_failure_closes_the_client() {
        // Grab a port nothing listens on.
        let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = parked.local_addr().unwrap();
        drop(parked);

        let table = Arc::new(RouteTable::new());
        table.create_mapping("my.srv", &dead_addr.to_string());
        let opts = options(table);
        let metrics = opts.metrics.clone();
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(opts).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_handshake("my.srv", 25565, 764, 1))
            .await
            .unwrap();

        let mut reply = Vec::new();
        time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(metrics.snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn oversize_varint_fails_the_handshake() {
        let opts = options(Arc::new(RouteTable::new()));
        let metrics = opts.metrics.clone();
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(opts).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0xFF; 6]).await.unwrap();

        // The parser stops after five continuation bytes, so the unread sixth
        // byte can turn the close into a reset; either way the client is done.
        let mut reply = Vec::new();
        let closed = time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap();
        assert!(closed.map(|n| n == 0).unwrap_or(true));
        assert_eq!(metrics.snapshot().handshake_failures, 1);
    }

    #[tokio::test]
    async fn silent_client_times_out_during_handshake() {
        let table = Arc::new(RouteTable::new());
        let opts = Arc::new(ConnectionOptions {
            handshake_timeout: Duration::from_millis(100),
            ..(*options(table)).clone()
        });
        let metrics = opts.metrics.clone();
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(opts).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut reply = Vec::new();
        time::timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(metrics.snapshot().handshake_failures, 1);
    }

    #[tokio::test]
    async fn backend_half_close_keeps_the_other_direction_open() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_ln.local_addr().unwrap();

        let wire = build_handshake("my.srv", 25565, 764, 1);
        let handshake_len = wire.len();
        let backend = tokio::spawn(async move {
            let (conn, _) = backend_ln.accept().await.unwrap();
            let (mut r, mut w) = conn.into_split();

            let mut hs = vec![0u8; handshake_len];
            r.read_exact(&mut hs).await.unwrap();

            // Close our write side early; keep reading.
            w.write_all(b"EARLY").await.unwrap();
            w.shutdown().await.unwrap();

            let mut rest = Vec::new();
            r.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let table = Arc::new(RouteTable::new());
        table.create_mapping("my.srv", &backend_addr.to_string());
        let (proxy_addr, _shutdown_tx, _serve) = spawn_proxy(options(table)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&wire).await.unwrap();

        let mut early = [0u8; 5];
        time::timeout(TEST_TIMEOUT, client.read_exact(&mut early))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&early, b"EARLY");

        // Backend's write shutdown surfaces as EOF here.
        let n = time::timeout(TEST_TIMEOUT, client.read(&mut [0u8; 16]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // The client->backend direction is still up.
        client.write_all(b"LATER").await.unwrap();
        client.shutdown().await.unwrap();

        let rest = time::timeout(TEST_TIMEOUT, backend).await.unwrap().unwrap();
        assert_eq!(rest, b"LATER");
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let (_proxy_addr, shutdown_tx, serve) = spawn_proxy(options(Arc::new(RouteTable::new()))).await;
        shutdown_tx.send(true).unwrap();
        time::timeout(TEST_TIMEOUT, serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
