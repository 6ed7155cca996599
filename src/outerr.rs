//! Captured stdout/stderr of the running command.
//!
//! Output written through an [`OutErr`] is buffered per stream and posted into
//! the build event stream as `progress` events. A stream's buffer is flushed as
//! soon as it grows past the configured buffer size, and whatever remains is
//! posted right before the stream closes. Each flush is split into chunks of at
//! most the configured chunk size, always on character boundaries.

use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, Weak};

use crate::streamer::{OutErrProvider, Streamer};

pub const DEFAULT_OUTERR_BUFFER_SIZE: usize = 10 * 1024;
pub const DEFAULT_OUTERR_CHUNK_SIZE: usize = 1024 * 1024;

struct CapturedStream {
    buffer: Mutex<Vec<u8>>,
    buffer_size: usize,
    chunk_size: usize,
    streamer: Weak<Streamer>,
}

impl CapturedStream {
    fn new(streamer: Weak<Streamer>, buffer_size: usize, chunk_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            buffer_size,
            chunk_size: chunk_size.max(1),
            streamer,
        }
    }

    /// Output arriving after the stream closed is discarded.
    fn write(&self, bytes: &[u8]) {
        let Some(streamer) = self.streamer.upgrade() else {
            return;
        };
        if streamer.is_closed() {
            return;
        }
        let buffered = {
            let mut buffer = self.buffer.lock();
            buffer.extend_from_slice(bytes);
            buffer.len()
        };
        if buffered > self.buffer_size {
            streamer.flush_output();
        }
    }

    /// Take the buffered text as chunks. A trailing partial UTF-8 sequence
    /// stays buffered until the rest of it is written.
    fn read_and_reset(&self) -> Vec<String> {
        let bytes = {
            let mut buffer = self.buffer.lock();
            let complete = complete_prefix_len(&buffer);
            let tail = buffer.split_off(complete);
            std::mem::replace(&mut *buffer, tail)
        };
        if bytes.is_empty() {
            return Vec::new();
        }
        chunk_text(&String::from_utf8_lossy(&bytes), self.chunk_size)
    }
}

fn complete_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => bytes.len(),
    }
}

fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = chunk_size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}

/// Output listener for one invocation.
#[derive(Clone)]
pub struct OutErr {
    out: Arc<CapturedStream>,
    err: Arc<CapturedStream>,
}

impl OutErr {
    /// Create the listener and register it with `streamer`.
    pub fn attach(streamer: &Arc<Streamer>, buffer_size: usize, chunk_size: usize) -> Self {
        let weak = Arc::downgrade(streamer);
        let out_err = Self {
            out: Arc::new(CapturedStream::new(weak.clone(), buffer_size, chunk_size)),
            err: Arc::new(CapturedStream::new(weak, buffer_size, chunk_size)),
        };
        streamer.register_out_err(Arc::new(out_err.clone()));
        out_err
    }

    pub fn out(&self) -> OutErrWriter {
        OutErrWriter(self.out.clone())
    }

    pub fn err(&self) -> OutErrWriter {
        OutErrWriter(self.err.clone())
    }
}

impl OutErrProvider for OutErr {
    fn take_out(&self) -> Vec<String> {
        self.out.read_and_reset()
    }

    fn take_err(&self) -> Vec<String> {
        self.err.read_and_reset()
    }
}

/// `std::io::Write` handle onto one captured stream.
pub struct OutErrWriter(Arc<CapturedStream>);

impl io::Write for OutErrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
