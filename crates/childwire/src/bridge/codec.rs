//! Newline-delimited JSON codec.
//!
//! Uses [`LineFramer`] for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, duplex streams, sockets).

use std::io;

use serde::de::IgnoredAny;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::framing::{LineFramer, LineTooLong};
use super::protocol::Message;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The line was not valid JSON. Deliberately carries no detail.
    #[error("malformed message")]
    Malformed,

    /// Valid JSON that is not a message this side understands, e.g. a
    /// missing `op` or a non-numeric id.
    #[error("unrecognized message")]
    Unrecognized,

    #[error(transparent)]
    TooLong(#[from] LineTooLong),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parse one line (terminator already stripped) into a message.
pub fn decode(line: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(line).map_err(|e| {
        tracing::trace!(error = %e, line_len = line.len(), "Rejected line");
        if serde_json::from_slice::<IgnoredAny>(line).is_ok() {
            CodecError::Unrecognized
        } else {
            CodecError::Malformed
        }
    })
}

/// Serialize a message without a trailing terminator.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

/// Codec that frames messages one per line.
///
/// Decoding yields `Result<Message, CodecError>` items instead of failing the
/// stream, so a single malformed line never tears down a `FramedRead`.
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    framer: LineFramer,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that reports lines over `max_length` bytes as [`CodecError::TooLong`].
    pub fn with_max_line_length(max_length: usize) -> Self {
        Self {
            framer: LineFramer::with_max_length(max_length),
        }
    }
}

impl Decoder for JsonLineCodec {
    type Item = Result<Message, CodecError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.absorb(src);
        loop {
            match self.framer.next_line() {
                Some(Ok(line)) if line.trim_ascii().is_empty() => continue,
                Some(Ok(line)) => return Ok(Some(decode(&line))),
                Some(Err(e)) => return Ok(Some(Err(e.into()))),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(op = item.op(), json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
