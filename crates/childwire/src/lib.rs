//! childwire: JSON-lines RPC between a parent process and a child it spawns.
//!
//! The parent writes newline-terminated JSON objects to the child's stdin and
//! reads them back from its stdout. Requests carry numeric ids; responses are
//! routed back to the handler registered for that id.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use childwire::{CommandSpawner, Worker, WorkerConfig};
//!
//! let worker = Worker::spawn(&CommandSpawner::node("worker.js"), WorkerConfig::default())?;
//! let reply = worker.call(serde_json::json!({"sup": "buddy 420"})).await?;
//! assert_eq!(reply["sup"], "buddy 420");
//! worker.stop();
//! worker.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod correlation;
pub mod events;
pub mod logging;
pub mod process;
pub mod worker;

pub use bridge::{CodecError, JsonLineCodec, LineFramer, LineTooLong, Message, RequestId};
pub use correlation::{CorrelationError, CorrelationTable, MAX_SAFE_ID, RequestError, ResponseHandler};
pub use events::{EventHub, InboundRequest};
pub use logging::init_tracing;
pub use process::{CommandSpawner, ProcessExit, ProcessHandle, SpawnError, WorkerSpawner};
pub use worker::{DEFAULT_MAX_LINE_LENGTH, Worker, WorkerConfig, WorkerError, WorkerState};
