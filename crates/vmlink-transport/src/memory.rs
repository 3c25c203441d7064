use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BufMut, BytesMut};
use vmlink_wire::{
    decode_header, encode_header, payload_size, Header, WireError, DEFAULT_MAX_PAYLOAD,
};

use crate::error::Result;
use crate::traits::PhysicalChannel;

/// In-memory physical channel.
///
/// Inbound bytes are queued with [`push`](Self::push) / [`push_raw`](Self::push_raw) and consumed
/// by the receive side exactly as a stream would be. Outbound frames are recorded instead of
/// transmitted. Used for loopback setups and for driving the dispatcher deterministically.
#[derive(Debug)]
pub struct MemoryChannel {
    name: String,
    vmid_local: u32,
    vmid_remote: u32,
    max_payload: usize,
    inbound: Mutex<BytesMut>,
    sent: Mutex<Vec<(Header, Vec<u8>)>>,
    sequence_rx: AtomicU32,
}

impl MemoryChannel {
    /// Create an empty channel with domain ids of zero.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vmid_local: 0,
            vmid_remote: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
            inbound: Mutex::new(BytesMut::new()),
            sent: Mutex::new(Vec::new()),
            sequence_rx: AtomicU32::new(0),
        }
    }

    /// Set the authoritative local and remote domain ids.
    pub fn with_vmids(mut self, local: u32, remote: u32) -> Self {
        self.vmid_local = local;
        self.vmid_remote = remote;
        self
    }

    /// Queue a header (size taken as declared) followed by `payload`.
    ///
    /// The declared size may disagree with `payload.len()`; this is how malformed input is
    /// simulated.
    pub fn push(&self, header: &Header, payload: &[u8]) -> Result<()> {
        let mut inbound = self.inbound();
        encode_header(header, &mut inbound)?;
        inbound.put_slice(payload);
        Ok(())
    }

    /// Queue raw bytes.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.inbound().put_slice(bytes);
    }

    /// Inbound bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.inbound().len()
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<(Header, Vec<u8>)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the frames sent so far.
    pub fn take_sent(&self) -> Vec<(Header, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn inbound(&self) -> MutexGuard<'_, BytesMut> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PhysicalChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_header(&self) -> Result<Header> {
        let mut inbound = self.inbound();
        let header = decode_header(&mut inbound, self.max_payload)?
            .ok_or(WireError::ConnectionClosed)?;
        self.sequence_rx.store(header.sequence, Ordering::Release);
        Ok(header)
    }

    fn read(&self, dst: &mut [u8]) -> usize {
        let mut inbound = self.inbound();
        let n = inbound.len().min(dst.len());
        dst[..n].copy_from_slice(&inbound[..n]);
        inbound.advance(n);
        n
    }

    fn send(&self, header: &Header, payload: &[u8]) -> Result<()> {
        let header = Header {
            size: payload_size(payload.len())?,
            ..*header
        };
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((header, payload.to_vec()));
        Ok(())
    }

    fn sequence_rx(&self) -> u32 {
        self.sequence_rx.load(Ordering::Acquire)
    }

    fn vmid_local(&self) -> u32 {
        self.vmid_local
    }

    fn vmid_remote(&self) -> u32 {
        self.vmid_remote
    }
}

#[cfg(test)]
mod tests {
    use vmlink_wire::PayloadType;

    use super::*;

    #[test]
    fn pushed_frames_read_back() {
        let channel = MemoryChannel::new("mem");
        channel
            .push(
                &Header::new(PayloadType::Msg, 4, 5, 7).with_sequence(11),
                b"data",
            )
            .unwrap();

        let header = channel.read_header().unwrap();
        assert_eq!(header.payload_type, PayloadType::Msg);
        assert_eq!(channel.sequence_rx(), 11);

        let mut dst = [0u8; 4];
        assert_eq!(channel.read(&mut dst), 4);
        assert_eq!(&dst, b"data");
        assert_eq!(channel.remaining(), 0);
    }

    #[test]
    fn empty_channel_reports_closed() {
        let channel = MemoryChannel::new("mem");
        assert!(channel.read_header().unwrap_err().is_closed());
    }

    #[test]
    fn sent_frames_are_recorded_with_real_size() {
        let channel = MemoryChannel::new("mem");
        channel
            .send(&Header::new(PayloadType::ExportAck, 0, 3, 4), &[1, 2, 3])
            .unwrap();

        let sent = channel.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.size, 3);
        assert!(channel.sent().is_empty());
    }
}
