use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};
use vmlink_transport::PhysicalChannel;
use vmlink_wire::{Header, PayloadType, WireError, MAX_VCHAN_ID};

use crate::clock::{Clock, SystemClock};
use crate::config::TransportConfig;
use crate::context::Context;
use crate::error::{LinkError, Result};
use crate::export::ExportRequest;
use crate::message::{BufferAllocator, MessageAllocator};
use crate::open::{OpenHandshake, OpenRequestQueue};
use crate::vchan::VirtualChannel;

type ChannelMap = HashMap<PchanKey, HashMap<(u32, u32), Arc<VirtualChannel>>>;

/// Identity of a physical channel: the address of the shared channel object.
///
/// Names are diagnostic only and need not be unique. The address stays stable for as long as a
/// registered virtual channel holds its `Arc`, so it cannot be reused by another channel while
/// the key is in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PchanKey(usize);

impl PchanKey {
    fn of(pchan: &dyn PhysicalChannel) -> Self {
        Self(pchan as *const dyn PhysicalChannel as *const () as usize)
    }
}

/// Owner of every virtual channel and the collaborators dispatch needs.
///
/// One `Transport` serves any number of physical channels; run one [`run`](Self::run) pump per
/// physical channel. Channels are keyed by (physical channel, vcid, session).
pub struct Transport {
    pub(crate) config: TransportConfig,
    pub(crate) allocator: MessageAllocator,
    pub(crate) open: Arc<dyn OpenHandshake>,
    pub(crate) clock: Arc<dyn Clock>,
    channels: RwLock<ChannelMap>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            allocator: MessageAllocator::new(&config),
            open: Arc::new(OpenRequestQueue::new()),
            clock: Arc::new(SystemClock),
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Replace the buffer source used for incoming messages.
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = MessageAllocator::with_allocator(&self.config, allocator);
        self
    }

    /// Replace the open-handshake collaborator.
    pub fn with_open_handshake(mut self, open: Arc<dyn OpenHandshake>) -> Self {
        self.open = open;
        self
    }

    /// Replace the clock used to stamp latency probes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a virtual channel whose open handshake has completed.
    pub fn open_channel(
        &self,
        pchan: Arc<dyn PhysicalChannel>,
        vchan_id: u32,
        session_id: u32,
        otherend_id: u32,
        context: Arc<Context>,
    ) -> Result<Arc<VirtualChannel>> {
        for id in [vchan_id, otherend_id] {
            if id == 0 || id > MAX_VCHAN_ID {
                return Err(WireError::ChannelIdOutOfRange(id).into());
            }
        }
        if session_id == 0 {
            return Err(LinkError::Open("session id 0 is reserved".into()));
        }

        let mut channels = self.channels_mut();
        let per_pchan = channels.entry(PchanKey::of(pchan.as_ref())).or_default();
        if per_pchan.contains_key(&(vchan_id, session_id)) {
            return Err(LinkError::Open(format!(
                "vcid {vchan_id:#x} session {session_id} already open on {}",
                pchan.name()
            )));
        }

        let vchan = Arc::new(VirtualChannel::new(
            Arc::clone(&pchan),
            vchan_id,
            session_id,
            otherend_id,
            context,
        ));
        per_pchan.insert((vchan_id, session_id), Arc::clone(&vchan));
        info!(
            pchan = pchan.name(),
            vcid = vchan_id,
            session = session_id,
            remote_vcid = otherend_id,
            "virtual channel opened"
        );
        Ok(vchan)
    }

    /// Resolve the channel a header addresses, taking a reference on it.
    pub fn lookup(
        &self,
        pchan: &dyn PhysicalChannel,
        header: &Header,
    ) -> Option<Arc<VirtualChannel>> {
        self.channels()
            .get(&PchanKey::of(pchan))?
            .get(&(header.vchan_id, header.session_id))
            .cloned()
    }

    /// Registered channels across all physical channels.
    pub fn channel_count(&self) -> usize {
        self.channels().values().map(HashMap::len).sum()
    }

    /// Send a MSG on `vchan`.
    pub fn send(&self, vchan: &VirtualChannel, payload: &[u8]) -> Result<()> {
        self.send_typed(vchan, PayloadType::Msg, payload)
    }

    /// Send an arbitrary connection-scoped payload type on `vchan`.
    pub fn send_typed(
        &self,
        vchan: &VirtualChannel,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<()> {
        if vchan.is_local_closed() {
            return Err(LinkError::Closed {
                vchan_id: vchan.id(),
            });
        }
        if vchan.is_remote_closed() {
            return Err(LinkError::RemoteClosed {
                vchan_id: vchan.id(),
            });
        }
        if payload.len() > self.config.max_payload_size {
            return Err(LinkError::OversizedPayload {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        trace!(vcid = vchan.id(), %payload_type, size = payload.len(), "send");
        vchan.send(payload_type, payload)
    }

    /// Offer a memory grant to the remote end of `vchan`.
    ///
    /// Pair with [`Context::wait_export_ack`] using `vchan.id()` to learn when it was accepted.
    pub fn send_export(&self, vchan: &VirtualChannel, request: &ExportRequest) -> Result<()> {
        let pchan = vchan.pchan();
        let mut payload = BytesMut::with_capacity(request.encoded_len());
        request.encode(
            (pchan.vmid_local(), pchan.vmid_remote()),
            (vchan.id(), vchan.otherend_id()),
            &mut payload,
        );
        debug!(
            vcid = vchan.id(),
            export_id = request.export_id,
            regions = request.regions.len(),
            "sending export"
        );
        self.send_typed(vchan, PayloadType::Export, &payload)
    }

    /// Close the local end of `vchan` and tell the remote end.
    ///
    /// The channel leaves the registry once both ends have closed.
    pub fn close(&self, vchan: &Arc<VirtualChannel>) -> Result<()> {
        if !vchan.close_local() {
            return Ok(());
        }
        let sent = if vchan.is_remote_closed() {
            Ok(())
        } else {
            vchan.send(PayloadType::Close, &[])
        };
        if vchan.is_remote_closed() {
            self.unregister(vchan);
        }
        debug!(vcid = vchan.id(), session = vchan.session_id(), "virtual channel closed locally");
        sent
    }

    /// Receive pump: read and dispatch headers until the stream ends.
    ///
    /// Per-message failures are logged and skipped. Returns `Ok` on a clean end of stream and
    /// the error when framing can no longer be trusted. Either way every channel on `pchan` is
    /// marked remotely closed on return.
    pub fn run(&self, pchan: Arc<dyn PhysicalChannel>) -> Result<()> {
        info!(pchan = pchan.name(), "receive pump started");
        let result = self.pump(&pchan);
        self.detach(pchan.as_ref());
        match &result {
            Ok(()) => info!(pchan = pchan.name(), "receive pump stopped"),
            Err(err) => error!(pchan = pchan.name(), error = %err, "receive pump failed"),
        }
        result
    }

    fn pump(&self, pchan: &Arc<dyn PhysicalChannel>) -> Result<()> {
        loop {
            let header = match pchan.read_header() {
                Ok(header) => header,
                Err(err) if err.is_closed() => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            match self.dispatch(pchan, &header) {
                Ok(outcome) => trace!(pchan = pchan.name(), ?outcome, "dispatched"),
                Err(err) if err.breaks_framing() => return Err(err),
                Err(err) => warn!(
                    pchan = pchan.name(),
                    payload_type = %header.payload_type,
                    vcid = header.vchan_id,
                    session = header.session_id,
                    size = header.size,
                    error = %err,
                    "message dropped"
                ),
            }
        }
    }

    /// Mark every channel on `pchan` remotely closed.
    fn detach(&self, pchan: &dyn PhysicalChannel) {
        let mut channels = self.channels_mut();
        let Some(per_pchan) = channels.get_mut(&PchanKey::of(pchan)) else {
            return;
        };
        for vchan in per_pchan.values() {
            vchan.mark_remote_closed();
        }
        per_pchan.retain(|_, vchan| !vchan.is_local_closed());
        let open = per_pchan.len();
        if open == 0 {
            channels.remove(&PchanKey::of(pchan));
        }
        debug!(pchan = pchan.name(), open, "physical channel detached");
    }

    pub(crate) fn unregister(&self, vchan: &VirtualChannel) {
        let mut channels = self.channels_mut();
        let key = PchanKey::of(vchan.pchan().as_ref());
        if let Some(per_pchan) = channels.get_mut(&key) {
            per_pchan.remove(&(vchan.id(), vchan.session_id()));
            if per_pchan.is_empty() {
                channels.remove(&key);
            }
        }
    }

    fn channels(&self) -> RwLockReadGuard<'_, ChannelMap> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels_mut(&self) -> RwLockWriteGuard<'_, ChannelMap> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}
