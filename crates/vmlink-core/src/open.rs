use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use vmlink_transport::PhysicalChannel;
use vmlink_wire::{OpenRequest, PayloadType};

use crate::error::{LinkError, Result};

/// Receiver of open-handshake traffic.
///
/// The dispatcher has checked the declared size; implementations read exactly `size` payload
/// bytes from `pchan` before returning.
pub trait OpenHandshake: Send + Sync {
    /// Record an INIT, INIT_ACK or INIT_DONE.
    fn add_open_request(
        &self,
        pchan: &dyn PhysicalChannel,
        size: usize,
        payload_type: PayloadType,
    ) -> Result<()>;

    /// Record an INIT_CANCEL.
    fn receive_cancel(&self, pchan: &dyn PhysicalChannel, size: usize) -> Result<()>;

    /// Wake threads waiting for open progress.
    fn wake(&self);
}

/// Open-handshake record received from a physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOpen {
    pub pchan: String,
    pub payload_type: PayloadType,
    pub request: OpenRequest,
}

/// Minimal [`OpenHandshake`]: a queue of received requests that callers wait on.
///
/// A cancel removes the pending requests it names; one that arrives first is queued so the
/// waiting side still sees it.
#[derive(Debug, Default)]
pub struct OpenRequestQueue {
    pending: Mutex<VecDeque<PendingOpen>>,
    ready: Condvar,
}

impl OpenRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests queued so far.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Remove the oldest request without waiting.
    pub fn try_take(&self) -> Option<PendingOpen> {
        self.pending().pop_front()
    }

    /// Remove the oldest request of `payload_type` for `sub_id`, waiting up to `timeout`.
    pub fn wait_for(
        &self,
        payload_type: PayloadType,
        sub_id: u32,
        timeout: Duration,
    ) -> Result<PendingOpen> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending();
        loop {
            if let Some(index) = pending
                .iter()
                .position(|p| p.payload_type == payload_type && p.request.sub_id == sub_id)
            {
                if let Some(found) = pending.remove(index) {
                    return Ok(found);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::TimedOut(timeout));
            }
            pending = self
                .ready
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingOpen>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_request(pchan: &dyn PhysicalChannel, size: usize) -> Result<OpenRequest> {
    if size != OpenRequest::SIZE {
        return Err(LinkError::SizeMismatch {
            expected: OpenRequest::SIZE,
            actual: size,
        });
    }
    let mut raw = [0u8; OpenRequest::SIZE];
    let read = pchan.read(&mut raw);
    if read != raw.len() {
        return Err(LinkError::ShortRead {
            expected: raw.len(),
            actual: read,
        });
    }
    Ok(OpenRequest::decode(&raw)?)
}

impl OpenHandshake for OpenRequestQueue {
    fn add_open_request(
        &self,
        pchan: &dyn PhysicalChannel,
        size: usize,
        payload_type: PayloadType,
    ) -> Result<()> {
        let request = read_request(pchan, size)?;
        debug!(
            pchan = pchan.name(),
            %payload_type,
            vcid = request.vchan_id,
            sub_id = request.sub_id,
            open_id = request.open_id,
            "open request received"
        );
        self.pending().push_back(PendingOpen {
            pchan: pchan.name().to_owned(),
            payload_type,
            request,
        });
        Ok(())
    }

    fn receive_cancel(&self, pchan: &dyn PhysicalChannel, size: usize) -> Result<()> {
        let request = read_request(pchan, size)?;
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|p| {
            !(p.pchan == pchan.name()
                && p.request.sub_id == request.sub_id
                && p.request.open_id == request.open_id)
        });
        let cancelled = before - pending.len();
        info!(
            pchan = pchan.name(),
            sub_id = request.sub_id,
            open_id = request.open_id,
            cancelled,
            "remote open cancel"
        );
        if cancelled == 0 {
            pending.push_back(PendingOpen {
                pchan: pchan.name().to_owned(),
                payload_type: PayloadType::InitCancel,
                request,
            });
        }
        drop(pending);
        self.ready.notify_all();
        Ok(())
    }

    fn wake(&self) {
        self.ready.notify_all();
    }
}
