//! Start/stop behaviour of the HTTP server over real sockets.

use std::time::{Duration, Instant};

use procwrap::error::{ConfigError, ContextError, Error, ShutdownError};
use procwrap::{HttpServer, StopToken, Step};

mod common;

#[tokio::test]
async fn serves_every_listener_and_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("server.sock");

    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::unix(&sock),
        Step::handler(common::router()),
    ]);
    let addr = common::tcp_addr(start.bindings());
    let running = tokio::spawn(start.start());

    let body = common::client()
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");

    let response = common::unix_get(&sock, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hello"));

    stop.stop(&StopToken::with_timeout(Duration::from_secs(5))).await.unwrap();
    running.await.unwrap().unwrap();
    assert!(!sock.exists());
}

#[tokio::test]
async fn close_failure_is_reported_and_other_listeners_still_close() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("gone.sock");

    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::unix(&sock),
        Step::handler(common::router()),
    ]);
    let addr = common::tcp_addr(start.bindings());
    let running = tokio::spawn(start.start());

    std::fs::remove_file(&sock).unwrap();
    let err = stop
        .stop(&StopToken::with_timeout(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown(ShutdownError::Close { .. })), "{err}");

    // Both accept loops ended because of the stop, not abnormally.
    running.await.unwrap().unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn no_listeners_fails_start() {
    let (start, stop) = HttpServer::build(vec![Step::handler(common::router())]);

    let err = start.start().await.unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::NoListeners)));
    stop.stop(&StopToken::new()).await.unwrap();
}

#[tokio::test]
async fn failed_step_fails_start() {
    let (start, _stop) = HttpServer::build(vec![
        Step::tls("/nonexistent/cert.pem", "/nonexistent/key.pem"),
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);

    let err = start.start().await.unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::InvalidCertificate(_))));
}

#[tokio::test]
async fn write_timeout_bounds_slow_handlers() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::write_timeout(Duration::from_millis(50)),
        Step::handler(common::router()),
    ]);
    let addr = common::tcp_addr(start.bindings());
    let running = tokio::spawn(start.start());

    let response = common::client()
        .get(format!("http://{addr}/slow"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::REQUEST_TIMEOUT);

    stop.stop(&StopToken::with_timeout(Duration::from_secs(5))).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_stop_is_a_noop() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);
    let running = tokio::spawn(start.start());

    stop.stop(&StopToken::new()).await.unwrap();
    stop.stop(&StopToken::new()).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_before_start_makes_start_return() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);

    stop.stop(&StopToken::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), start.start())
        .await
        .expect("start did not return")
        .unwrap();
}

#[tokio::test]
async fn in_flight_request_past_deadline_is_incomplete() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);
    let addr = common::tcp_addr(start.bindings());
    let running = tokio::spawn(start.start());

    let request = tokio::spawn(common::client().get(format!("http://{addr}/hang")).send());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = stop
        .stop(&StopToken::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    let errors: Vec<_> = err.iter().collect();
    assert_eq!(errors.len(), 2, "{err}");
    assert!(matches!(errors[0], Error::Shutdown(ShutdownError::Incomplete { .. })));
    assert!(matches!(errors[1], Error::Context(ContextError::DeadlineExceeded)));

    running.await.unwrap().unwrap();
    // The forced connection was dropped without a response.
    assert!(request.await.unwrap().is_err());
}

#[tokio::test]
async fn grace_delay_is_cut_short_by_the_deadline() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::grace(Duration::from_secs(5)),
        Step::handler(common::router()),
    ]);
    let running = tokio::spawn(start.start());

    let began = Instant::now();
    let err = stop
        .stop(&StopToken::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(began.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)));
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_token_is_folded_into_the_result() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);
    let running = tokio::spawn(start.start());

    let token = StopToken::new();
    token.cancel();
    let err = stop.stop(&token).await.unwrap_err();
    assert!(err.is_context());
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn tls_listener_serves_https() {
    let (start, stop) = HttpServer::build(vec![
        Step::tls(common::fixture("cert.pem"), common::fixture("key.pem")),
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);
    let addr = common::tcp_addr(start.bindings());
    assert!(start.bindings()[0].to_string().starts_with("tls://"));
    let running = tokio::spawn(start.start());

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let body = client
        .get(format!("https://localhost:{}/", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");

    stop.reload_tls(&common::fixture("cert.pem"), &common::fixture("key.pem"))
        .unwrap();
    stop.stop(&StopToken::with_timeout(Duration::from_secs(5))).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn reload_without_tls_is_rejected() {
    let (_start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::handler(common::router()),
    ]);
    assert!(stop
        .reload_tls(&common::fixture("cert.pem"), &common::fixture("key.pem"))
        .is_err());
}

#[tokio::test]
async fn start_returns_only_after_stop_finishes() {
    let (start, stop) = HttpServer::build(vec![
        Step::tcp("127.0.0.1:0"),
        Step::grace(Duration::from_millis(300)),
        Step::handler(common::router()),
    ]);
    let running = tokio::spawn(start.start());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopping = tokio::spawn(async move {
        stop.stop(&StopToken::with_timeout(Duration::from_secs(5))).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Listeners are closed, but the grace delay is still running.
    assert!(!running.is_finished());

    stopping.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("start did not return after stop")
        .unwrap()
        .unwrap();
}
