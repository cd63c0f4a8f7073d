//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use procwrap::net::ListenerBinding;

/// Handler used by the server tests.
///
/// `/slow` takes longer than the write timeouts used in tests, `/hang` longer
/// than any shutdown deadline.
pub fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "slow"
            }),
        )
        .route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "hang"
            }),
        )
}

/// Address of the first network listener.
pub fn tcp_addr(bindings: &[ListenerBinding]) -> SocketAddr {
    bindings
        .iter()
        .find_map(ListenerBinding::socket_addr)
        .expect("no TCP listener bound")
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Plain HTTP/1.1 GET over a Unix socket; returns the raw response.
pub async fn unix_get(path: &Path, uri: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(path).await?;
    let request = format!("GET {uri} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

pub fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}
