//! Worker notifications.
//!
//! Each notification kind has its own subscriber list. Every subscriber gets
//! its own unbounded channel, so subscribers never lag or steal events from
//! each other and always see events in emission order. All channels close
//! once the worker has emitted `exit`.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::RequestId;
use crate::process::ProcessExit;
use crate::worker::WorkerError;

/// A `request` sent by the child to the parent.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub id: RequestId,
    pub body: serde_json::Value,
}

/// Fan-out list for one notification kind.
struct Subscribers<T> {
    inner: Mutex<SubscriberList<T>>,
}

struct SubscriberList<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

impl<T: Clone> Subscribers<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SubscriberList {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Subscribing after close hands back an already-finished receiver.
        if !list.closed {
            list.senders.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber. Returns how many received it.
    fn emit(&self, event: T) -> usize {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if list.closed {
            return 0;
        }
        list.senders.retain(|tx| tx.send(event.clone()).is_ok());
        list.senders.len()
    }

    fn close(&self) {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.closed = true;
        list.senders.clear();
    }

    fn len(&self) -> usize {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.senders.retain(|tx| !tx.is_closed());
        list.senders.len()
    }
}

struct Hub {
    stdout: Subscribers<Bytes>,
    stderr: Subscribers<Bytes>,
    error: Subscribers<WorkerError>,
    exit: Subscribers<ProcessExit>,
    requests: Subscribers<InboundRequest>,
}

/// Subscription point for worker notifications.
///
/// Cheap to clone; clones share subscribers. Create one before spawning (see
/// [`Worker::spawn_with_events`](crate::Worker::spawn_with_events)) to be
/// sure no early output is missed.
#[derive(Clone)]
pub struct EventHub {
    hub: Arc<Hub>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                stdout: Subscribers::new(),
                stderr: Subscribers::new(),
                error: Subscribers::new(),
                exit: Subscribers::new(),
                requests: Subscribers::new(),
            }),
        }
    }

    /// Raw stdout chunks, exactly as read and before framing.
    pub fn subscribe_stdout(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.hub.stdout.subscribe()
    }

    pub fn subscribe_stderr(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.hub.stderr.subscribe()
    }

    /// Parse, read and write failures. None of them stop the worker.
    pub fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<WorkerError> {
        self.hub.error.subscribe()
    }

    /// Fires exactly once, after which every channel closes.
    pub fn subscribe_exit(&self) -> mpsc::UnboundedReceiver<ProcessExit> {
        self.hub.exit.subscribe()
    }

    /// Requests initiated by the child. Nothing answers them yet; this is
    /// the slot a parent-side request handler plugs into.
    pub fn subscribe_requests(&self) -> mpsc::UnboundedReceiver<InboundRequest> {
        self.hub.requests.subscribe()
    }

    pub(crate) fn emit_stdout(&self, chunk: Bytes) {
        self.hub.stdout.emit(chunk);
    }

    pub(crate) fn emit_stderr(&self, chunk: Bytes) {
        self.hub.stderr.emit(chunk);
    }

    pub(crate) fn emit_error(&self, error: WorkerError) {
        self.hub.error.emit(error);
    }

    pub(crate) fn emit_request(&self, request: InboundRequest) -> usize {
        self.hub.requests.emit(request)
    }

    /// Emit `exit` and close every channel.
    pub(crate) fn emit_exit(&self, exit: ProcessExit) {
        self.hub.exit.emit(exit);
        self.close();
    }

    fn close(&self) {
        self.hub.stdout.close();
        self.hub.stderr.close();
        self.hub.error.close();
        self.hub.exit.close();
        self.hub.requests.close();
    }

    /// Live subscriber count per kind, in the order stdout, stderr, error, exit, requests.
    pub fn subscriber_counts(&self) -> [usize; 5] {
        [
            self.hub.stdout.len(),
            self.hub.stderr.len(),
            self.hub.error.len(),
            self.hub.exit.len(),
            self.hub.requests.len(),
        ]
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_event_in_order() {
        let hub = EventHub::new();
        let mut a = hub.subscribe_stdout();
        let mut b = hub.subscribe_stdout();

        hub.emit_stdout(Bytes::from("one"));
        hub.emit_stdout(Bytes::from("two"));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await, Some(Bytes::from("one")));
            assert_eq!(rx.recv().await, Some(Bytes::from("two")));
        }
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let hub = EventHub::new();
        let mut out = hub.subscribe_stdout();
        let mut err = hub.subscribe_stderr();

        hub.emit_stderr(Bytes::from("diag"));

        assert_eq!(err.recv().await, Some(Bytes::from("diag")));
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_closes_all_channels() {
        let hub = EventHub::new();
        let mut out = hub.subscribe_stdout();
        let mut exit = hub.subscribe_exit();

        hub.emit_exit(ProcessExit::from_code(Some(0)));
        hub.emit_stdout(Bytes::from("late"));

        assert_eq!(exit.recv().await, Some(ProcessExit::from_code(Some(0))));
        assert_eq!(exit.recv().await, None);
        assert_eq!(out.recv().await, None);
    }

    #[tokio::test]
    async fn subscribe_after_exit_is_already_closed() {
        let hub = EventHub::new();
        hub.emit_exit(ProcessExit::from_code(None));

        let mut errors = hub.subscribe_errors();
        assert!(errors.recv().await.is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe_requests();
        assert_eq!(hub.subscriber_counts()[4], 1);
        drop(rx);

        let delivered = hub.emit_request(InboundRequest {
            id: RequestId::new(1),
            body: serde_json::Value::Null,
        });
        assert_eq!(delivered, 0);
        assert_eq!(hub.subscriber_counts(), [0; 5]);
    }
}
