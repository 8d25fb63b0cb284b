//! Inbound session loop shared by the server and the proxy
//!
//! A session reads request frames from one accepted socket, validates each at
//! the decode boundary and hands it to a [`RequestHandler`] on its own task, so
//! pipelined requests are served concurrently. Responses funnel through a
//! single writer task, which keeps frames on the socket from interleaving.

use crate::error::FramingError;
use crate::protocol::{JsonLinesCodec, Request, Response, WireRequest};
use async_trait::async_trait;
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Responses queued for the writer before handlers start waiting
const OUTBOUND_QUEUE: usize = 256;

type ServerCodec = JsonLinesCodec<WireRequest, Response>;

/// Produces exactly one response per validated request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Serve one client connection until it closes.
///
/// Returns `Err` only for a [`FramingError`], after which the connection has
/// been dropped without waiting for in-flight requests.
pub async fn serve_connection<R, W, H>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    handler: Arc<H>,
    max_frame_bytes: usize,
) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    let mut frames = FramedRead::new(reader, ServerCodec::new(max_frame_bytes));
    let mut sink = FramedWrite::new(writer, ServerCodec::new(max_frame_bytes));
    let (tx, mut rx) = mpsc::channel::<Response>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = sink.send(response).await {
                tracing::warn!(peer = %peer, error = %e, "failed to write response, dropping session writer");
                break;
            }
        }
    });

    let outcome = loop {
        let wire = match frames.next().await {
            Some(Ok(wire)) => wire,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        let id = wire.id.clone();
        match Request::from_wire(wire) {
            Ok(request) => {
                tracing::debug!(peer = %peer, id = %request.id, key = %request.cache_key(), "dispatching request");
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handler.handle(request).await;
                    // the client may have gone away; nothing left to deliver to
                    let _ = tx.send(response).await;
                });
            }
            Err(e) => {
                tracing::debug!(peer = %peer, id = %id, error = %e, "rejecting invalid request");
                if tx.send(Response::error(id, e.to_string())).await.is_err() {
                    break Ok(());
                }
            }
        }
    };
    drop(tx);

    match outcome {
        Ok(()) => {
            // flush responses for requests still in flight
            let _ = writer_task.await;
            Ok(())
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "framing error, closing connection");
            writer_task.abort();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Source, Status};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct EchoIdHandler;

    #[async_trait]
    impl RequestHandler for EchoIdHandler {
        async fn handle(&self, request: Request) -> Response {
            Response::ok(request.id.clone(), json!(request.id), Source::Computed)
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn read_response<R: AsyncBufReadExt + Unpin>(lines: &mut R) -> Response {
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requests_and_protocol_errors() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(serve_connection(
            server_read,
            server_write,
            peer(),
            Arc::new(EchoIdHandler),
            1024,
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read);

        client_write
            .write_all(b"{\"id\":\"bad\",\"kind\":\"nope\"}\n")
            .await
            .unwrap();
        let resp = read_response(&mut lines).await;
        assert_eq!(resp.id, "bad");
        assert_eq!(resp.status, Status::Error);

        client_write
            .write_all(b"{\"id\":\"ok\",\"kind\":\"text\",\"prompt\":\"hi\"}\n")
            .await
            .unwrap();
        let resp = read_response(&mut lines).await;
        assert_eq!(resp.id, "ok");
        assert_eq!(resp.status, Status::Ok);

        client_write.shutdown().await.unwrap();
        assert!(session.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_framing_error_closes_session() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(serve_connection(
            server_read,
            server_write,
            peer(),
            Arc::new(EchoIdHandler),
            1024,
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"this is not json\n").await.unwrap();

        let result = session.await.unwrap();
        assert!(matches!(result, Err(FramingError::MalformedJson { .. })));

        // server side is gone, so the client sees end of stream
        let mut lines = BufReader::new(client_read);
        let mut line = String::new();
        assert_eq!(lines.read_line(&mut line).await.unwrap(), 0);
    }
}
