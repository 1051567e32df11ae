//! Worker facade - the parent side of a childwire channel.
//!
//! A [`Worker`] owns one child process and runs two tasks for it:
//! - **event loop**: reads stdout/stderr, frames and decodes lines, resolves
//!   pending requests, and waits for the child to exit
//! - **writer**: drains an unbounded queue of outbound messages into stdin
//!
//! `send`, `request` and `stop` only enqueue, so they never block. Response
//! handlers run on the event loop task, one at a time, in the order their
//! lines arrived.
//!
//! Lifecycle: `Running` until the child terminates, then `Stopped`. Once the
//! exit has been observed the loop drains any output still buffered in the
//! pipes, shuts the writer down, settles pending requests and finally emits
//! `exit`. Nothing is emitted after that.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{self, CodecError, JsonLineCodec};
use crate::bridge::framing::LineFramer;
use crate::bridge::protocol::{Message, RequestId};
use crate::correlation::{CorrelationError, CorrelationTable, RequestError, ResponseHandler};
use crate::events::{EventHub, InboundRequest};
use crate::process::{BoxedReader, BoxedWriter, ProcessExit, ProcessHandle, SpawnError, WorkerSpawner};

/// Errors reported by a worker, either returned from a call or delivered
/// through [`EventHub::subscribe_errors`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// A line from the child could not be parsed.
    #[error("failed to parse a message")]
    Malformed,

    #[error("failed to write to worker: {0}")]
    Write(String),

    #[error("failed to read worker {stream}: {error}")]
    Read { stream: &'static str, error: String },

    /// The worker has exited and no longer accepts messages.
    #[error("worker channel closed")]
    Closed,

    /// A stdout line grew past [`WorkerConfig::max_line_length`] and was dropped.
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("response handler for request {0} panicked")]
    HandlerPanicked(RequestId),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Default cap on a single stdout line (16 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Invoke outstanding handlers with [`RequestError::Aborted`] when the
    /// child exits. When false they are left in place and never run.
    pub abort_pending_on_exit: bool,
    /// How long to keep reading stdout/stderr after the child has exited.
    pub exit_drain_timeout: Duration,
    /// Longest stdout line accepted, terminator excluded.
    pub max_line_length: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            abort_pending_on_exit: true,
            exit_drain_timeout: Duration::from_millis(500),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abort_pending_on_exit(mut self, abort: bool) -> Self {
        self.abort_pending_on_exit = abort;
        self
    }

    pub fn with_exit_drain_timeout(mut self, timeout: Duration) -> Self {
        self.exit_drain_timeout = timeout;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }
}

struct Shared {
    table: Mutex<CorrelationTable>,
    outbound: mpsc::UnboundedSender<Message>,
    running: AtomicBool,
    exited: watch::Receiver<Option<ProcessExit>>,
    events: EventHub,
    kill: CancellationToken,
    pid: Option<u32>,
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, CorrelationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a child process speaking the childwire protocol.
///
/// Cheap to clone; all clones drive the same child.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    /// Launch a child and start serving it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spawner: &dyn WorkerSpawner, config: WorkerConfig) -> Result<Self, SpawnError> {
        Self::spawn_with_events(spawner, config, EventHub::new())
    }

    /// Like [`Worker::spawn`], delivering notifications to a hub the caller
    /// has already subscribed to.
    pub fn spawn_with_events(
        spawner: &dyn WorkerSpawner,
        config: WorkerConfig,
        events: EventHub,
    ) -> Result<Self, SpawnError> {
        let process = spawner.spawn()?;
        tracing::info!(pid = ?process.pid(), "Worker started");
        Ok(Self::attach(process, config, events))
    }

    /// Serve an already running process.
    pub fn attach(process: ProcessHandle, config: WorkerConfig, events: EventHub) -> Self {
        let ProcessHandle {
            stdin,
            stdout,
            stderr,
            exit,
            kill,
            pid,
        } = process;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            table: Mutex::new(CorrelationTable::new()),
            outbound: outbound_tx,
            running: AtomicBool::new(true),
            exited: exited_rx,
            events: events.clone(),
            kill,
            pid,
        });

        let writer_shutdown = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            stdin,
            outbound_rx,
            events,
            writer_shutdown.clone(),
        ));

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            inbound: Inbound::new(stdout, stderr, config.max_line_length),
            exit,
            writer,
            writer_shutdown,
            exited_tx,
            config,
        };
        tokio::spawn(event_loop.run());

        Self { shared }
    }

    /// Write a message to the child.
    ///
    /// Fails only once the worker has fully stopped; write errors while the
    /// child is alive are reported through the error subscription.
    pub fn send(&self, message: Message) -> Result<(), WorkerError> {
        self.shared
            .outbound
            .send(message)
            .map_err(|_| WorkerError::Closed)
    }

    /// Send `body` as a request; `handler` runs at most once with the response.
    ///
    /// There is no built-in timeout: if the child never answers, the handler
    /// only runs when the child exits (and only with `abort_pending_on_exit`).
    ///
    /// An `Err` means the handler was dropped without running; it is never
    /// both returned and delivered to the handler.
    pub fn request<F>(&self, body: serde_json::Value, handler: F) -> Result<RequestId, WorkerError>
    where
        F: FnOnce(Result<serde_json::Value, RequestError>) + Send + 'static,
    {
        let id = {
            let mut table = self.shared.lock_table();
            let id = table.allocate();
            table.register(id, Box::new(handler))?;
            id
        };

        tracing::trace!(%id, "Sending request");
        match self.send(Message::request(id, body)) {
            Ok(()) => Ok(id),
            Err(e) => self.unregister_unsent(id, e),
        }
    }

    /// Undo a registration whose message never reached the writer.
    ///
    /// If the exit path already took the handler (and aborted it), the
    /// caller has been told through the handler, so this reports success.
    fn unregister_unsent(&self, id: RequestId, error: WorkerError) -> Result<RequestId, WorkerError> {
        match self.shared.lock_table().take(id) {
            Some(_) => Err(error),
            None => {
                tracing::trace!(%id, "Request settled by exit before send failed");
                Ok(id)
            }
        }
    }

    /// Send `body` as a request and wait for the response.
    ///
    /// Wrap in `tokio::time::timeout` for a deadline.
    pub async fn call(&self, body: serde_json::Value) -> Result<serde_json::Value, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.request(body, move |result| {
            let _ = tx.send(result);
        })
        .map_err(|_| RequestError::Closed)?;
        rx.await.unwrap_or(Err(RequestError::Aborted))
    }

    /// Forget a pending request without running its handler.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.shared.lock_table().take(id).is_some()
    }

    /// Ask the child to stop. Sends `{"op":"stop"}` only while running.
    ///
    /// Returns whether a stop message was queued. The state only changes
    /// when the child actually exits.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.send(Message::Stop) {
            Ok(()) => {
                tracing::debug!(pid = ?self.shared.pid, "Stop requested");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stop not sent");
                false
            }
        }
    }

    /// Forcefully terminate the child.
    pub fn kill(&self) {
        self.shared.kill.cancel();
    }

    pub fn state(&self) -> WorkerState {
        if self.is_running() {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Wait until `exit` has been emitted and every event channel is closed.
    pub async fn wait(&self) -> ProcessExit {
        let mut exited = self.shared.exited.clone();
        match exited.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit::from_code(None)),
            Err(_) => ProcessExit::from_code(None),
        }
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_table().pending_count()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.shared.pid)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn run_writer(
    stdin: BoxedWriter,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: EventHub,
    shutdown: CancellationToken,
) {
    let mut writer = FramedWrite::new(stdin, JsonLineCodec::new());

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let op = message.op();
        let id = message.id();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = writer.send(message) => {
                if let Err(e) = result {
                    tracing::warn!(op, ?id, error = %e, "Failed to write message to child");
                    events.emit_error(WorkerError::Write(e.to_string()));
                }
            }
        }
    }

    tracing::trace!("Writer task exiting");
}

/// Reader side of the event loop: raw chunks in, dispatched messages out.
struct Inbound {
    stdout: ReaderStream<BoxedReader>,
    stderr: ReaderStream<BoxedReader>,
    stdout_open: bool,
    stderr_open: bool,
    framer: LineFramer,
}

impl Inbound {
    fn new(stdout: BoxedReader, stderr: BoxedReader, max_line_length: usize) -> Self {
        Self {
            stdout: ReaderStream::new(stdout),
            stderr: ReaderStream::new(stderr),
            stdout_open: true,
            stderr_open: true,
            framer: LineFramer::with_max_length(max_line_length),
        }
    }

    fn is_open(&self) -> bool {
        self.stdout_open || self.stderr_open
    }

    /// Wait for and handle one chunk (or close) from either stream.
    ///
    /// Cancel safe: all work after a chunk arrives is synchronous.
    async fn step(&mut self, shared: &Shared) {
        tokio::select! {
            chunk = self.stdout.next(), if self.stdout_open => match chunk {
                Some(Ok(chunk)) => self.on_stdout(shared, chunk),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Failed to read child stdout");
                    shared.events.emit_error(WorkerError::Read {
                        stream: "stdout",
                        error: e.to_string(),
                    });
                    self.stdout_open = false;
                }
                None => {
                    tracing::trace!("Child stdout closed");
                    self.stdout_open = false;
                }
            },
            chunk = self.stderr.next(), if self.stderr_open => match chunk {
                Some(Ok(chunk)) => shared.events.emit_stderr(chunk),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Failed to read child stderr");
                    shared.events.emit_error(WorkerError::Read {
                        stream: "stderr",
                        error: e.to_string(),
                    });
                    self.stderr_open = false;
                }
                None => {
                    tracing::trace!("Child stderr closed");
                    self.stderr_open = false;
                }
            },
        }
    }

    fn on_stdout(&mut self, shared: &Shared, chunk: Bytes) {
        shared.events.emit_stdout(chunk.clone());
        for line in self.framer.feed(&chunk) {
            match line {
                Ok(line) => dispatch_line(shared, line),
                Err(e) => {
                    tracing::warn!(max = e.max, "Dropping overlong line from child");
                    shared.events.emit_error(WorkerError::LineTooLong { max: e.max });
                }
            }
        }
    }

    /// Discard an unterminated tail left when stdout closed.
    fn finish(&mut self) {
        let remainder = self.framer.take_remainder();
        if !remainder.trim_ascii().is_empty() {
            tracing::warn!(
                bytes = remainder.len(),
                "Discarding unterminated output from child"
            );
        }
    }
}

fn dispatch_line(shared: &Shared, line: Bytes) {
    if line.trim_ascii().is_empty() {
        return;
    }

    match codec::decode(&line) {
        Ok(Message::Response { id, body }) => {
            let handler = shared.lock_table().take(id);
            match handler {
                Some(handler) => invoke_handler(shared, id, handler, Ok(body)),
                None => tracing::trace!(%id, "Dropping response with no pending request"),
            }
        }
        Ok(Message::Request { id, body }) => {
            if shared.events.emit_request(InboundRequest { id, body }) == 0 {
                tracing::debug!(%id, "Ignoring request from child (no subscribers)");
            }
        }
        Ok(message) => {
            tracing::debug!(op = message.op(), "Ignoring unsupported message from child");
        }
        Err(CodecError::Unrecognized) => {
            tracing::debug!(line_len = line.len(), "Ignoring unrecognized message from child");
        }
        Err(e) => {
            tracing::warn!(error = %e, line_len = line.len(), "Failed to parse message from child");
            shared.events.emit_error(WorkerError::Malformed);
        }
    }
}

fn invoke_handler(
    shared: &Shared,
    id: RequestId,
    handler: ResponseHandler,
    result: Result<serde_json::Value, RequestError>,
) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || handler(result))).is_err() {
        tracing::error!(%id, "Response handler panicked");
        shared.events.emit_error(WorkerError::HandlerPanicked(id));
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    inbound: Inbound,
    exit: BoxFuture<'static, ProcessExit>,
    writer: JoinHandle<()>,
    writer_shutdown: CancellationToken,
    exited_tx: watch::Sender<Option<ProcessExit>>,
    config: WorkerConfig,
}

impl EventLoop {
    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let pid = shared.pid;

        let exit = loop {
            tokio::select! {
                biased;

                exit = &mut self.exit => break exit,
                _ = self.inbound.step(&shared), if self.inbound.is_open() => {}
            }
        };

        shared.running.store(false, Ordering::Release);
        tracing::debug!(?pid, %exit, "Child process exited");

        if self.inbound.is_open() {
            let drain_timeout = self.config.exit_drain_timeout;
            let inbound = &mut self.inbound;
            let drain = async {
                while inbound.is_open() {
                    inbound.step(&shared).await;
                }
            };
            if tokio::time::timeout(drain_timeout, drain).await.is_err() {
                tracing::warn!(?pid, "Child output still open after exit, closing it");
            }
        }
        self.inbound.finish();

        // Once the writer is gone, new requests fail fast instead of
        // registering handlers nobody will settle.
        self.writer_shutdown.cancel();
        if let Err(e) = (&mut self.writer).await {
            tracing::error!(error = %e, "Writer task failed");
        }

        self.settle_pending();

        tracing::info!(?pid, %exit, "Worker stopped");
        shared.events.emit_exit(exit);
        self.exited_tx.send_replace(Some(exit));
    }

    fn settle_pending(&self) {
        let drained = {
            let mut table = self.shared.lock_table();
            if !self.config.abort_pending_on_exit {
                let orphaned = table.pending_count();
                if orphaned > 0 {
                    tracing::warn!(orphaned, "Child exited with requests still pending");
                }
                return;
            }
            table.drain()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Aborting pending requests");
        }
        for (id, handler) in drained {
            invoke_handler(&self.shared, id, handler, Err(RequestError::Aborted));
        }
    }
}
