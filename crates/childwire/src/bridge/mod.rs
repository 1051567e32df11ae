//! Wire format for parent-child communication.
//!
//! # Architecture
//!
//! - **protocol**: Message types (`request`, `response`, `stop`)
//! - **framing**: Reassembles `\n`-terminated lines from chunked input
//! - **codec**: JSON line codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod framing;
pub mod protocol;

pub use codec::{CodecError, JsonLineCodec, decode, encode};
pub use framing::{LineFramer, LineTooLong, Lines};
pub use protocol::{Message, RequestId};
