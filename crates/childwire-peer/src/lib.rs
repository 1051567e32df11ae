//! Child side of a childwire channel.
//!
//! [`run_peer`] reads requests from the parent, runs each one on its own task
//! through a [`RequestHandler`], and writes the responses back with the
//! request's id. Responses go out in completion order, not arrival order.
//!
//! The loop ends when the parent sends `stop` or closes the pipe. Requests
//! already in flight at that point still get their responses.

use std::io;
use std::sync::Arc;

use childwire::{CodecError, JsonLineCodec, Message};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Produces a response body for each request body.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, body: serde_json::Value) -> serde_json::Value;
}

/// Answers every request with its own body.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait::async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, body: serde_json::Value) -> serde_json::Value {
        body
    }
}

/// Why the peer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerExit {
    /// The parent sent `stop`.
    Stopped,
    /// The parent closed our stdin.
    Closed,
}

/// Serve requests until `stop` or end of input.
///
/// Returns an error only if the output side fails; malformed input lines are
/// logged and skipped.
pub async fn run_peer<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> io::Result<PeerExit>
where
    H: RequestHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonLineCodec::new());
    let mut writer = FramedWrite::new(writer, JsonLineCodec::new());

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Message>();
    let mut in_flight = JoinSet::new();

    tracing::info!("Peer ready");

    let exit = loop {
        tokio::select! {
            biased;

            Some(response) = response_rx.recv() => {
                writer.send(response).await?;
            }

            Some(joined) = in_flight.join_next() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Request handler task failed");
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(Ok(Message::Request { id, body }))) => {
                    tracing::trace!(%id, "Request received");
                    let handler = Arc::clone(&handler);
                    let response_tx = response_tx.clone();
                    in_flight.spawn(async move {
                        let body = handler.handle(body).await;
                        let _ = response_tx.send(Message::response(id, body));
                    });
                }
                Some(Ok(Ok(Message::Stop))) => {
                    tracing::info!("Stop requested");
                    break PeerExit::Stopped;
                }
                Some(Ok(Ok(other))) => {
                    tracing::debug!(op = other.op(), "Ignoring message");
                }
                Some(Ok(Err(CodecError::Unrecognized))) => {
                    tracing::debug!("Ignoring unrecognized message");
                }
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Skipping malformed line");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Failed to read from parent");
                    break PeerExit::Closed;
                }
                None => {
                    tracing::info!("Input closed (parent gone?), exiting");
                    break PeerExit::Closed;
                }
            },
        }
    };

    let remaining = in_flight.len();
    if remaining > 0 {
        tracing::debug!(remaining, "Waiting for in-flight requests");
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Request handler task failed");
        }
    }

    drop(response_tx);
    while let Some(response) = response_rx.recv().await {
        writer.send(response).await?;
    }

    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use childwire::RequestId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Parent {
        stdin: DuplexStream,
        stdout: FramedRead<DuplexStream, JsonLineCodec>,
    }

    impl Parent {
        async fn write(&mut self, bytes: &[u8]) {
            self.stdin.write_all(bytes).await.unwrap();
        }

        async fn request(&mut self, id: u64, body: serde_json::Value) {
            let line = format!(
                "{}\n",
                childwire::bridge::encode(&Message::request(RequestId::new(id), body)).unwrap()
            );
            self.write(line.as_bytes()).await;
        }

        async fn next(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(5), self.stdout.next())
                .await
                .expect("timed out")
                .map(|frame| frame.unwrap().unwrap())
        }
    }

    fn start<H: RequestHandler>(handler: H) -> (Parent, tokio::task::JoinHandle<io::Result<PeerExit>>) {
        let (parent_in, child_in) = tokio::io::duplex(64 * 1024);
        let (child_out, parent_out) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_peer(Arc::new(handler), child_in, child_out));
        let parent = Parent {
            stdin: parent_in,
            stdout: FramedRead::new(parent_out, JsonLineCodec::new()),
        };
        (parent, task)
    }

    /// Sleeps for `body.delay_ms` before echoing.
    struct Delayed;

    #[async_trait::async_trait]
    impl RequestHandler for Delayed {
        async fn handle(&self, body: serde_json::Value) -> serde_json::Value {
            let delay = body["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            body
        }
    }

    #[tokio::test]
    async fn echoes_with_same_id() {
        let (mut parent, _task) = start(Echo);

        parent.request(7, json!({"sup": "buddy 420"})).await;

        assert_eq!(
            parent.next().await,
            Some(Message::response(RequestId::new(7), json!({"sup": "buddy 420"})))
        );
    }

    #[tokio::test]
    async fn stop_ends_loop() {
        let (mut parent, task) = start(Echo);

        parent.write(b"{\"op\":\"stop\"}\n").await;

        assert_eq!(task.await.unwrap().unwrap(), PeerExit::Stopped);
        assert_eq!(parent.next().await, None);
    }

    #[tokio::test]
    async fn closed_input_ends_loop() {
        let (parent, task) = start(Echo);
        drop(parent.stdin);

        assert_eq!(task.await.unwrap().unwrap(), PeerExit::Closed);
    }

    #[tokio::test]
    async fn malformed_and_foreign_lines_are_skipped() {
        let (mut parent, _task) = start(Echo);

        parent.write(b"garbage\n\n[1,2]\n").await;
        parent
            .write(b"{\"op\":\"response\",\"id\":1,\"body\":null}\n{\"op\":\"ping\"}\n")
            .await;
        parent.request(2, json!("still alive")).await;

        assert_eq!(
            parent.next().await,
            Some(Message::response(RequestId::new(2), json!("still alive")))
        );
    }

    #[tokio::test]
    async fn responses_follow_completion_order() {
        let (mut parent, _task) = start(Delayed);

        parent.request(1, json!({"delay_ms": 200})).await;
        parent.request(2, json!({"delay_ms": 0})).await;

        let first = parent.next().await.unwrap();
        let second = parent.next().await.unwrap();
        assert_eq!(first.id(), Some(RequestId::new(2)));
        assert_eq!(second.id(), Some(RequestId::new(1)));
    }

    #[tokio::test]
    async fn in_flight_requests_finish_after_stop() {
        let (mut parent, task) = start(Delayed);

        parent.request(1, json!({"delay_ms": 50})).await;
        parent.write(b"{\"op\":\"stop\"}\n").await;

        assert_eq!(
            parent.next().await,
            Some(Message::response(RequestId::new(1), json!({"delay_ms": 50})))
        );
        assert_eq!(task.await.unwrap().unwrap(), PeerExit::Stopped);
    }
}
