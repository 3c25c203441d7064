use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};
use vmlink_transport::PhysicalChannel;

use crate::config::TransportConfig;
use crate::error::{LinkError, Result};

const DRAIN_CHUNK_SIZE: usize = 4096;

/// Source of receive buffers.
///
/// Returning `None` models allocation failure; the allocator never aborts the process.
pub trait BufferAllocator: Send + Sync {
    /// A zero-filled buffer of exactly `len` bytes, or `None` if it cannot be provided.
    fn alloc(&self, len: usize) -> Option<Vec<u8>>;
}

/// Heap allocator using fallible reservation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BufferAllocator for SystemAllocator {
    fn alloc(&self, len: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).ok()?;
        buf.resize(len, 0);
        Some(buf)
    }
}

enum Body {
    Contiguous(Vec<u8>),
    Scattered(Vec<Vec<u8>>),
}

/// A received payload.
///
/// Stored either as one buffer or as page-sized chunks when one large buffer was not available;
/// both views below work regardless of the representation. `len()` is the number of bytes
/// actually transferred from the stream, which is less than the declared size only if the
/// stream ended mid-payload.
pub struct Message {
    body: Body,
    size: usize,
    sequence_rx: u32,
}

impl Message {
    /// Wrap a locally built payload.
    pub fn from_vec(data: Vec<u8>, sequence_rx: u32) -> Self {
        Self {
            size: data.len(),
            body: Body::Contiguous(data),
            sequence_rx,
        }
    }

    /// Bytes transferred into this message.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Receive sequence of the physical channel when the message arrived.
    pub fn sequence_rx(&self) -> u32 {
        self.sequence_rx
    }

    /// True when the payload is held in page-sized chunks.
    pub fn is_scattered(&self) -> bool {
        matches!(self.body, Body::Scattered(_))
    }

    /// Number of owned buffers backing this message.
    pub fn chunk_count(&self) -> usize {
        match &self.body {
            Body::Contiguous(_) => 1,
            Body::Scattered(chunks) => chunks.len(),
        }
    }

    /// The payload, if it is stored contiguously.
    pub fn as_contiguous(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Contiguous(buf) => Some(&buf[..self.size]),
            Body::Scattered(_) => None,
        }
    }

    /// Payload bytes in order, one slice per backing buffer.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut remaining = self.size;
        self.buffers().iter().map_while(move |chunk| {
            if remaining == 0 {
                return None;
            }
            let take = chunk.len().min(remaining);
            remaining -= take;
            Some(&chunk[..take])
        })
    }

    /// Copy the payload into `dst`, returning the number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks() {
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    /// The payload as one owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Convert into `Bytes`, without copying when the payload is contiguous.
    pub fn into_bytes(self) -> Bytes {
        match self.body {
            Body::Contiguous(mut buf) => {
                buf.truncate(self.size);
                Bytes::from(buf)
            }
            Body::Scattered(_) => Bytes::from(self.to_vec()),
        }
    }

    /// Overwrite payload bytes starting at `offset`, crossing chunk boundaries as needed.
    ///
    /// Writes stop at the end of the payload; returns the number of bytes written.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> usize {
        let end = offset.saturating_add(src.len()).min(self.size);
        let buffers: &mut [Vec<u8>] = match &mut self.body {
            Body::Contiguous(buf) => std::slice::from_mut(buf),
            Body::Scattered(chunks) => chunks.as_mut_slice(),
        };

        let mut pos = offset;
        let mut base = 0usize;
        for chunk in buffers.iter_mut() {
            if pos >= end {
                break;
            }
            let chunk_end = base + chunk.len();
            if pos < chunk_end {
                let from = pos - base;
                let n = chunk_end.min(end) - pos;
                let src_off = pos - offset;
                chunk[from..from + n].copy_from_slice(&src[src_off..src_off + n]);
                pos += n;
            }
            base = chunk_end;
        }
        pos.saturating_sub(offset)
    }

    fn buffers(&self) -> &[Vec<u8>] {
        match &self.body {
            Body::Contiguous(buf) => std::slice::from_ref(buf),
            Body::Scattered(chunks) => chunks,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.size)
            .field("scattered", &self.is_scattered())
            .field("chunks", &self.chunk_count())
            .field("sequence_rx", &self.sequence_rx)
            .finish()
    }
}

/// Acquires message buffers and fills them from a physical channel.
///
/// Every destination byte is secured before the first byte is read: the stream is destructive,
/// so a half-received payload could never be handed back.
#[derive(Clone)]
pub struct MessageAllocator {
    allocator: Arc<dyn BufferAllocator>,
    max_payload: usize,
    page_size: usize,
}

impl MessageAllocator {
    /// Allocator backed by [`SystemAllocator`].
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    /// Allocator backed by a custom buffer source.
    pub fn with_allocator(config: &TransportConfig, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            max_payload: config.max_payload_size,
            page_size: config.page_size.max(1),
        }
    }

    /// Allocate a message of `size` bytes and drain exactly that many bytes into it.
    ///
    /// Fails without touching the stream when `size` exceeds the payload ceiling or when no
    /// buffer (contiguous or scattered) can be acquired.
    pub fn allocate(&self, pchan: &dyn PhysicalChannel, size: usize) -> Result<Message> {
        if size > self.max_payload {
            error!(
                pchan = pchan.name(),
                size,
                max = self.max_payload,
                "message size too large"
            );
            return Err(LinkError::OversizedPayload {
                size,
                max: self.max_payload,
            });
        }

        match self.allocator.alloc(size) {
            Some(mut buf) => {
                let read = pchan.read(&mut buf);
                Ok(Message {
                    body: Body::Contiguous(buf),
                    size: read,
                    sequence_rx: pchan.sequence_rx(),
                })
            }
            // Large contiguous buffers fail first under fragmentation; retry page by page.
            None => self.allocate_scattered(pchan, size),
        }
    }

    fn allocate_scattered(&self, pchan: &dyn PhysicalChannel, size: usize) -> Result<Message> {
        if size <= self.page_size {
            return Err(LinkError::AllocationFailure { size });
        }

        let count = size.div_ceil(self.page_size);
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        if chunks.try_reserve_exact(count).is_err() {
            return Err(LinkError::AllocationFailure { size });
        }

        for index in 0..count {
            let len = (size - index * self.page_size).min(self.page_size);
            match self.allocator.alloc(len) {
                Some(chunk) => chunks.push(chunk),
                None => {
                    debug!(
                        pchan = pchan.name(),
                        size,
                        allocated = index,
                        "scatter allocation failed; nothing read"
                    );
                    return Err(LinkError::AllocationFailure { size });
                }
            }
        }

        let mut transferred = 0;
        for chunk in chunks.iter_mut() {
            let read = pchan.read(chunk);
            transferred += read;
            if read < chunk.len() {
                warn!(pchan = pchan.name(), size, transferred, "scattered payload truncated");
                break;
            }
        }

        Ok(Message {
            body: Body::Scattered(chunks),
            size: transferred,
            sequence_rx: pchan.sequence_rx(),
        })
    }
}

impl fmt::Debug for MessageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageAllocator")
            .field("max_payload", &self.max_payload)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Read and discard `size` payload bytes so the next header stays aligned.
///
/// Uses a fixed scratch buffer; needs no allocation. Returns the bytes actually discarded.
pub(crate) fn drain(pchan: &dyn PhysicalChannel, size: usize) -> usize {
    let mut scratch = [0u8; DRAIN_CHUNK_SIZE];
    let mut drained = 0;
    while drained < size {
        let want = (size - drained).min(scratch.len());
        let read = pchan.read(&mut scratch[..want]);
        drained += read;
        if read < want {
            warn!(pchan = pchan.name(), size, drained, "stream ended while draining");
            break;
        }
    }
    drained
}
