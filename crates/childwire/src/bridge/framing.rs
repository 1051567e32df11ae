//! Line framing for chunked byte streams.
//!
//! Pipes deliver bytes in whatever chunks the OS hands us, so a single
//! message line can straddle any number of reads. [`LineFramer`] keeps the
//! unterminated tail of the stream between calls and only ever yields lines
//! that were terminated by `\n`.

use std::io;

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

const TERMINATOR: u8 = b'\n';

/// A line grew past the framer's limit and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line exceeds {max} bytes")]
pub struct LineTooLong {
    pub max: usize,
}

/// Reassembles `\n`-terminated lines from arbitrary chunks.
///
/// Each byte is searched for a terminator once, however many chunks a line
/// spans. Lines longer than the configured maximum are dropped up to and
/// including their terminator and reported as [`LineTooLong`].
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    /// Prefix of `buf` already known to contain no terminator.
    scanned: usize,
    max_length: usize,
    /// Dropping input until the next terminator.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_length(usize::MAX)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer that drops lines longer than `max_length` bytes (terminator excluded).
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_length,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Append `chunk` and iterate the complete lines now available.
    ///
    /// Lines are produced lazily. Any line left unread when the iterator is
    /// dropped stays buffered and comes out of the next `feed` (or
    /// [`LineFramer::lines`]) call.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buf.extend_from_slice(chunk);
        self.lines()
    }

    /// Iterate complete lines already buffered, without adding input.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { framer: self }
    }

    /// Pop the next complete line, terminator stripped.
    pub fn next_line(&mut self) -> Option<Result<Bytes, LineTooLong>> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|&b| b == TERMINATOR)
                .map(|offset| self.scanned + offset);

            match found {
                Some(pos) if self.discarding => {
                    self.buf.advance(pos + 1);
                    self.scanned = 0;
                    self.discarding = false;
                }
                Some(pos) if pos > self.max_length => {
                    self.buf.advance(pos + 1);
                    self.scanned = 0;
                    return Some(Err(self.too_long()));
                }
                Some(pos) => {
                    let line = self.buf.split_to(pos).freeze();
                    self.buf.advance(1);
                    self.scanned = 0;
                    return Some(Ok(line));
                }
                None if self.discarding => {
                    self.buf.clear();
                    self.scanned = 0;
                    return None;
                }
                None if self.buf.len() > self.max_length => {
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Err(self.too_long()));
                }
                None => {
                    self.scanned = self.buf.len();
                    return None;
                }
            }
        }
    }

    fn too_long(&self) -> LineTooLong {
        LineTooLong {
            max: self.max_length,
        }
    }

    /// Bytes buffered after the last terminator (plus any unread lines).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take whatever is buffered, leaving the framer empty.
    pub fn take_remainder(&mut self) -> Bytes {
        self.scanned = 0;
        self.discarding = false;
        self.buf.split().freeze()
    }
}

/// Lazy iterator over complete lines. See [`LineFramer::feed`].
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Result<Bytes, LineTooLong>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_line()
    }
}

/// Lets the framer drive a `FramedRead` directly.
impl Decoder for LineFramer {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.absorb(src);
        self.next_line()
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl LineFramer {
    /// Move everything from `src` into the framer's own buffer.
    pub(crate) fn absorb(&mut self, src: &mut BytesMut) {
        if !src.is_empty() {
            let chunk = src.split();
            self.buf.extend_from_slice(&chunk);
        }
    }
}
