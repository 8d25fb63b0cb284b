//! Edge case and failure scenario tests for Calc Relay
//!
//! These tests talk raw bytes to a running server:
//! - Frames split across TCP writes
//! - Malformed and oversized frames
//! - Invalid payloads that must not close the connection
//! - Pipelined requests answered out of order

use calc_relay::{Dispatcher, RelayServer};
use serde_json::Value;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const MAX_FRAME: usize = 256;

async fn start_server() -> (RelayServer<Dispatcher>, SocketAddr) {
    let dispatcher = Arc::new(Dispatcher::new(NonZeroUsize::new(8).unwrap()));
    let mut server = RelayServer::new(dispatcher, "127.0.0.1:0".to_string(), MAX_FRAME);
    let addr = server.start().await.expect("Failed to start server");
    (server, addr)
}

async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    (BufReader::new(read), write)
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Value {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("Timed out waiting for response")
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn assert_closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("Connection should be closed");
    assert!(read.is_err() || rest.is_empty(), "unexpected bytes: {:?}", rest);
}

#[tokio::test]
async fn test_frame_split_across_writes_is_one_request() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    let frame = b"{\"id\":\"split\",\"kind\":\"calc\",\"operator\":\"mul\",\"operands\":[6,7]}\n";
    for chunk in frame.chunks(9) {
        writer.write_all(chunk).await.unwrap();
        writer.flush().await.unwrap();
        sleep(Duration::from_millis(5)).await;
    }

    let resp = read_response(&mut reader).await;
    assert_eq!(resp["id"], "split");
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["result"], 42);
}

#[tokio::test]
async fn test_two_frames_in_one_write() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    writer
        .write_all(
            b"{\"id\":\"a\",\"kind\":\"text\",\"prompt\":\"one\"}\n{\"id\":\"b\",\"kind\":\"text\",\"prompt\":\"two\"}\n",
        )
        .await
        .unwrap();

    let mut ids = vec![
        read_response(&mut reader).await["id"].as_str().unwrap().to_string(),
        read_response(&mut reader).await["id"].as_str().unwrap().to_string(),
    ];
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_invalid_payload_keeps_connection_open() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    writer
        .write_all(b"{\"id\":\"bad\",\"kind\":\"calc\",\"operator\":\"frobnicate\",\"operands\":[1,2]}\n")
        .await
        .unwrap();
    let resp = read_response(&mut reader).await;
    assert_eq!(resp["id"], "bad");
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["errorMessage"], "unknown operator 'frobnicate'");

    writer
        .write_all(b"{\"id\":\"div\",\"kind\":\"calc\",\"operator\":\"div\",\"operands\":[1,0]}\n")
        .await
        .unwrap();
    let resp = read_response(&mut reader).await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["source"], "computed");

    writer
        .write_all(b"{\"id\":\"good\",\"kind\":\"calc\",\"operator\":\"sub\",\"operands\":[10,4]}\n")
        .await
        .unwrap();
    let resp = read_response(&mut reader).await;
    assert_eq!(resp["id"], "good");
    assert_eq!(resp["result"], 6);
}

#[tokio::test]
async fn test_malformed_json_closes_connection() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    writer.write_all(b"this is not json\n").await.unwrap();
    assert_closed(&mut reader).await;
}

#[tokio::test]
async fn test_missing_id_closes_connection() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    writer
        .write_all(b"{\"kind\":\"text\",\"prompt\":\"anonymous\"}\n")
        .await
        .unwrap();
    assert_closed(&mut reader).await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    let prompt = "x".repeat(MAX_FRAME * 2);
    let frame = format!("{{\"id\":\"big\",\"kind\":\"text\",\"prompt\":\"{}\"}}\n", prompt);
    // the server may close before the whole frame is written
    let _ = writer.write_all(frame.as_bytes()).await;
    assert_closed(&mut reader).await;
}

#[tokio::test]
async fn test_framing_error_does_not_affect_other_clients() {
    let (_server, addr) = start_server().await;
    let (mut bad_reader, mut bad_writer) = connect(addr).await;
    let (mut reader, mut writer) = connect(addr).await;

    bad_writer.write_all(b"[1,2,3]\n").await.unwrap();
    assert_closed(&mut bad_reader).await;

    writer
        .write_all(b"{\"id\":\"ok\",\"kind\":\"calc\",\"operator\":\"max\",\"operands\":[3,9,4]}\n")
        .await
        .unwrap();
    let resp = read_response(&mut reader).await;
    assert_eq!(resp["result"], 9);
}

#[tokio::test]
async fn test_responses_carry_timing_metadata() {
    let (_server, addr) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    writer
        .write_all(b"{\"id\":\"t\",\"kind\":\"calc\",\"operator\":\"sqrt\",\"operands\":[16]}\n")
        .await
        .unwrap();
    let resp = read_response(&mut reader).await;
    assert_eq!(resp["result"], 4);
    assert!(resp["tookMs"].is_u64());
}
