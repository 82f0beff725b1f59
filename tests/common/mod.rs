//! Shared utilities for integration tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use admission_gate::config::GateConfig;
use admission_gate::lifecycle::Shutdown;
use admission_gate::HttpServer;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Start an upstream whose replies come from `f`. Returns its address.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        // requests in these tests are bodiless GETs; one read covers the head
                        let mut buf = [0u8; 4096];
                        let _ = socket.read(&mut buf).await;

                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start an upstream that answers `body` after `delay`.
pub async fn start_slow_backend(delay: Duration, body: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move {
        tokio::time::sleep(delay).await;
        (200, body.to_string())
    })
    .await
}

/// Gate config forwarding to `upstream` with the given capacity.
pub fn gate_config(upstream: SocketAddr, max_concurrent: usize) -> GateConfig {
    let mut config = GateConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.address = upstream.to_string();
    config.admission.max_concurrent = max_concurrent;
    config
}

/// Run a gate on an ephemeral port. Trigger the returned `Shutdown` to stop it.
pub async fn start_gate(config: GateConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Fetch the status surface.
pub async fn status(client: &reqwest::Client, gate: SocketAddr) -> Value {
    client
        .get(format!("http://{}/api/admin/concurrency-status", gate))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll the status surface until `pred` holds, failing after five seconds.
pub async fn wait_for_status<P>(client: &reqwest::Client, gate: SocketAddr, pred: P) -> Value
where
    P: Fn(&Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = status(client, gate).await;
        if pred(&current) {
            return current;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "gate never reached expected status, last: {current}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
