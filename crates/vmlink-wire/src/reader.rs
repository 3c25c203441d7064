use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::{decode_header, Header, WireConfig};
use crate::error::{Result, WireError};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads headers and payload bytes from any `Read` stream.
///
/// Headers are decoded from an internal buffer; payload bytes are served from the same buffer
/// first so nothing read ahead is ever lost between a header and its payload.
pub struct HeaderReader<T> {
    inner: T,
    buf: BytesMut,
    config: WireConfig,
}

impl<T: Read> HeaderReader<T> {
    /// Create a new header reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    /// Create a new header reader with explicit configuration.
    pub fn with_config(inner: T, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete header (blocking).
    ///
    /// Returns `Err(WireError::ConnectionClosed)` when EOF is reached.
    pub fn read_header(&mut self) -> Result<Header> {
        loop {
            if let Some(header) = decode_header(&mut self.buf, self.config.max_payload_size)? {
                return Ok(header);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };

            if read == 0 {
                if !self.buf.is_empty() {
                    trace!(pending = self.buf.len(), "stream ended inside a header");
                }
                return Err(WireError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Fill `dst` with payload bytes (blocking).
    ///
    /// Returns the number of bytes copied, which is short of `dst.len()` only when the stream
    /// ended. An I/O error after some bytes were copied is `PartialPayload`, which carries that
    /// count.
    pub fn read_payload(&mut self, dst: &mut [u8]) -> Result<usize> {
        let buffered = self.buf.len().min(dst.len());
        if buffered > 0 {
            dst[..buffered].copy_from_slice(&self.buf[..buffered]);
            self.buf.advance(buffered);
        }

        let mut filled = buffered;
        while filled < dst.len() {
            match self.inner.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if filled == 0 => return Err(WireError::Io(err)),
                Err(source) => return Err(WireError::PartialPayload { filled, source }),
            }
        }
        Ok(filled)
    }

    /// Bytes read ahead of the last decoded header and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &WireConfig {
        &self.config
    }
}
