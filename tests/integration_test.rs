//! Integration tests for Calc Relay
//!
//! These tests run a real backend server and proxy on loopback sockets and
//! drive them the way a client would.

use calc_relay::connection::Connection;
use calc_relay::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use calc_relay::protocol::{Operator, Request, Source, Status};
use calc_relay::{
    BackendHealth, Dispatcher, ForwardingEngine, ForwardingOptions, RelayServer, RetryPolicy,
};
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_backend(address: &str) -> RelayServer<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::new(NonZeroUsize::new(64).unwrap()));
    let mut server = RelayServer::new(dispatcher, address.to_string(), DEFAULT_MAX_FRAME_BYTES);
    server.start().await.expect("Failed to start backend");
    server
}

async fn start_proxy(backend: &str) -> RelayServer<ForwardingEngine> {
    let engine = Arc::new(ForwardingEngine::new(ForwardingOptions {
        backend_address: backend.to_string(),
        cache_capacity: NonZeroUsize::new(64).unwrap(),
        forward_timeout: Duration::from_millis(500),
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        cache_first: false,
    }));
    engine.connect_backend(RetryPolicy::once()).await;
    let mut proxy = RelayServer::new(engine, "127.0.0.1:0".to_string(), DEFAULT_MAX_FRAME_BYTES);
    proxy.start().await.expect("Failed to start proxy");
    proxy
}

async fn client(server: &RelayServer<impl calc_relay::session::RequestHandler>) -> Connection {
    let address = server.local_addr().unwrap().to_string();
    Connection::connect(&address, DEFAULT_MAX_FRAME_BYTES)
        .await
        .expect("Failed to connect")
}

#[tokio::test]
async fn test_repeat_request_is_served_from_server_cache() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("calc_relay=debug")
        .try_init();

    let backend = start_backend("127.0.0.1:0").await;
    let conn = client(&backend).await;

    let req = Request::calc("1", Operator::Add, vec![2.0, 3.0]);
    let first = conn.request(req.to_wire(), TIMEOUT).await.unwrap();
    assert_eq!(first.status, Status::Ok);
    assert_eq!(first.result, Some(json!(5)));
    assert_eq!(first.source, Source::Computed);

    let req = Request::calc("2", Operator::Add, vec![2.0, 3.0]);
    let second = conn.request(req.to_wire(), TIMEOUT).await.unwrap();
    assert_eq!(second.id, "2");
    assert_eq!(second.result, Some(json!(5)));
    assert_eq!(second.source, Source::ServerCache);
}

#[tokio::test]
async fn test_request_through_proxy() {
    let backend = start_backend("127.0.0.1:0").await;
    let proxy = start_proxy(&backend.local_addr().unwrap().to_string()).await;
    let conn = client(&proxy).await;

    let resp = conn
        .request(Request::text("t1", "hello relay").to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(resp.id, "t1");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.result, Some(json!("[echo] hello relay (2 words)")));
    assert_eq!(resp.source, Source::Computed);

    let resp = conn
        .request(Request::text("t2", "hello relay").to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(resp.source, Source::ServerCache);
    assert_eq!(proxy.handler().health(), BackendHealth::Up);
}

#[tokio::test]
async fn test_degraded_mode_returns_proxy_cache() {
    let mut backend = start_backend("127.0.0.1:0").await;
    let proxy = start_proxy(&backend.local_addr().unwrap().to_string()).await;
    let conn = client(&proxy).await;

    let warm = conn
        .request(Request::calc("w", Operator::Mul, vec![6.0, 7.0]).to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(warm.result, Some(json!(42)));

    backend.shutdown().await.unwrap();

    let resp = conn
        .request(Request::calc("r", Operator::Mul, vec![7.0, 6.0]).to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(resp.id, "r");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.result, Some(json!(42)));
    assert_eq!(resp.source, Source::ProxyCache);
    assert_eq!(proxy.handler().health(), BackendHealth::Down);
}

#[tokio::test]
async fn test_cold_miss_with_backend_down_fails_promptly() {
    let mut backend = start_backend("127.0.0.1:0").await;
    let proxy = start_proxy(&backend.local_addr().unwrap().to_string()).await;
    backend.shutdown().await.unwrap();

    let conn = client(&proxy).await;
    let started = Instant::now();
    let resp = conn
        .request(Request::text("cold", "never asked before").to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(resp.status, Status::Error);
    assert_eq!(resp.error_message.as_deref(), Some("service unavailable"));
    assert!(started.elapsed() < Duration::from_secs(2));

    // the client connection stays open for retries
    let again = conn
        .request(Request::text("cold-2", "still not there").to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(again.error_message.as_deref(), Some("service unavailable"));
}

#[tokio::test]
async fn test_proxy_recovers_when_backend_restarts() {
    let mut backend = start_backend("127.0.0.1:0").await;
    let address = backend.local_addr().unwrap().to_string();
    let proxy = start_proxy(&address).await;
    backend.shutdown().await.unwrap();

    let conn = client(&proxy).await;
    let down = conn
        .request(Request::calc("a", Operator::Sub, vec![9.0, 4.0]).to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(down.status, Status::Error);

    let _backend = start_backend(&address).await;
    let up = conn
        .request(Request::calc("b", Operator::Sub, vec![9.0, 4.0]).to_wire(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(up.status, Status::Ok);
    assert_eq!(up.result, Some(json!(5)));
    assert_eq!(proxy.handler().health(), BackendHealth::Up);
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_entry() {
    let backend = start_backend("127.0.0.1:0").await;
    let conn = Arc::new(client(&backend).await);

    let mut handles = vec![];
    for i in 0..20 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            let req = Request::calc(format!("c{}", i), Operator::Pow, vec![2.0, 10.0]);
            conn.request(req.to_wire(), TIMEOUT).await
        }));
    }

    let mut computed = 0;
    for handle in handles {
        let resp = handle.await.unwrap().unwrap();
        assert_eq!(resp.result, Some(json!(1024)));
        if resp.source == Source::Computed {
            computed += 1;
        }
    }

    assert_eq!(computed, 1);
    assert_eq!(backend.handler().cache().len().await, 1);
}
