use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, error, info, warn};
use vmlink_transport::PhysicalChannel;
use vmlink_wire::{
    ExportAck, Header, OpenRequest, PayloadType, ProfileStat, EXPORT_PREFIX_SIZE, SCHE_TICK_SIZE,
};

use crate::error::{LinkError, Result};
use crate::export::{ExportDescriptor, ExportError};
use crate::message::{drain, Message};
use crate::transport::Transport;
use crate::vchan::VirtualChannel;

/// What dispatch did with a header that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A message was queued on the channel.
    Queued { vchan_id: u32, size: usize },
    /// The payload was consumed and discarded.
    Dropped(DropReason),
    /// An open-handshake record went to the open collaborator.
    OpenForwarded(PayloadType),
    /// An export was validated, registered and acknowledged.
    ExportRegistered { export_id: u32 },
    /// An export acknowledgement was queued for the exporter.
    ExportAckQueued { export_id: u32 },
    /// The remote end closed the channel.
    Closed { vchan_id: u32 },
}

/// Why an accepted header's payload was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// PROFILE payload shorter than a stat record.
    ShortProfile { size: usize },
    /// SCHE_MSG / SCHE_MSG_ACK payload shorter than a tick.
    ShortScheduleProbe { size: usize },
    /// The local end was closed; the remote end has not closed yet.
    LocallyClosed { vchan_id: u32 },
}

impl Transport {
    /// Handle one received header, consuming exactly its payload from `pchan`.
    ///
    /// Rejected headers still consume their declared payload, except where
    /// [`LinkError::breaks_framing`] says otherwise.
    pub fn dispatch(
        &self,
        pchan: &Arc<dyn PhysicalChannel>,
        header: &Header,
    ) -> Result<Dispatch> {
        if header.payload_type.is_open_handshake() {
            return self.dispatch_open(pchan.as_ref(), header);
        }

        let size = header.payload_len();
        if matches!(header.payload_type, PayloadType::Unknown(_))
            || header.vchan_id == 0
            || header.session_id == 0
        {
            error!(
                pchan = pchan.name(),
                payload_type = %header.payload_type,
                vcid = header.vchan_id,
                session = header.session_id,
                size,
                "invalid header"
            );
            drain(pchan.as_ref(), size);
            return Err(LinkError::MalformedHeader {
                payload_type: header.payload_type,
                vchan_id: header.vchan_id,
                session_id: header.session_id,
            });
        }

        let Some(vchan) = self.lookup(pchan.as_ref(), header) else {
            drain(pchan.as_ref(), size);
            warn!(
                pchan = pchan.name(),
                payload_type = %header.payload_type,
                vcid = header.vchan_id,
                session = header.session_id,
                size,
                "no channel for message; dropped"
            );
            return Err(LinkError::ChannelNotFound {
                vchan_id: header.vchan_id,
                session_id: header.session_id,
            });
        };

        if vchan.is_remote_closed() {
            drain(pchan.as_ref(), size);
            info!(
                pchan = pchan.name(),
                payload_type = %header.payload_type,
                vcid = header.vchan_id,
                session = header.session_id,
                size,
                "message for remotely closed channel dropped"
            );
            return Err(LinkError::RemoteClosed {
                vchan_id: header.vchan_id,
            });
        }

        match header.payload_type {
            PayloadType::Msg | PayloadType::ScheResultReq | PayloadType::ScheResultRsp => {
                let msg = self.receive(pchan.as_ref(), size)?;
                Ok(queue(&vchan, msg))
            }
            PayloadType::Export => self.receive_export(pchan, &vchan, size),
            PayloadType::ExportAck => receive_export_ack(pchan.as_ref(), &vchan, size),
            PayloadType::Close => {
                drain(pchan.as_ref(), size);
                debug!(
                    vcid = vchan.id(),
                    remote_vcid = vchan.otherend_id(),
                    session = vchan.session_id(),
                    refs = VirtualChannel::ref_count(&vchan),
                    "remote close"
                );
                vchan.mark_remote_closed();
                if vchan.is_local_closed() {
                    self.unregister(&vchan);
                }
                Ok(Dispatch::Closed {
                    vchan_id: vchan.id(),
                })
            }
            PayloadType::Profile => {
                let received = self.clock.timestamp();
                if size < ProfileStat::SIZE {
                    drain(pchan.as_ref(), size);
                    error!(
                        pchan = pchan.name(),
                        size,
                        need = ProfileStat::SIZE,
                        "profile payload too short"
                    );
                    return Ok(Dispatch::Dropped(DropReason::ShortProfile { size }));
                }
                let mut msg = self.receive(pchan.as_ref(), size)?;
                let stamp = ProfileStat::rx_stamp(
                    received.as_secs(),
                    u64::from(received.subsec_micros()),
                );
                msg.write_at(ProfileStat::RX_OFFSET, &stamp);
                Ok(queue(&vchan, msg))
            }
            PayloadType::ScheMsg | PayloadType::ScheMsgAck => {
                if size < SCHE_TICK_SIZE {
                    drain(pchan.as_ref(), size);
                    error!(
                        pchan = pchan.name(),
                        size,
                        need = SCHE_TICK_SIZE,
                        "schedule probe too short"
                    );
                    return Ok(Dispatch::Dropped(DropReason::ShortScheduleProbe { size }));
                }
                let ticks = self.clock.ticks();
                let mut msg = self.receive(pchan.as_ref(), size)?;
                msg.write_at(0, &ticks.to_le_bytes());
                Ok(queue(&vchan, msg))
            }
            // Filtered out above.
            PayloadType::Init
            | PayloadType::InitAck
            | PayloadType::InitDone
            | PayloadType::InitCancel
            | PayloadType::Unknown(_) => Err(LinkError::MalformedHeader {
                payload_type: header.payload_type,
                vchan_id: header.vchan_id,
                session_id: header.session_id,
            }),
        }
    }

    fn dispatch_open(&self, pchan: &dyn PhysicalChannel, header: &Header) -> Result<Dispatch> {
        let size = header.payload_len();
        if size != OpenRequest::SIZE {
            error!(
                pchan = pchan.name(),
                payload_type = %header.payload_type,
                vcid = header.vchan_id,
                session = header.session_id,
                size,
                "invalid open request"
            );
            drain(pchan, size);
            return Err(LinkError::MalformedOpen {
                payload_type: header.payload_type,
                size,
                expected: OpenRequest::SIZE,
            });
        }

        if header.payload_type == PayloadType::InitCancel {
            info!(
                pchan = pchan.name(),
                vcid = header.vchan_id,
                session = header.session_id,
                local = pchan.vmid_local(),
                remote = pchan.vmid_remote(),
                "remote open cancel"
            );
            self.open.receive_cancel(pchan, size)?;
        } else {
            self.open
                .add_open_request(pchan, size, header.payload_type)?;
            self.open.wake();
        }
        Ok(Dispatch::OpenForwarded(header.payload_type))
    }

    /// Allocate and fill a message, draining the payload if no buffer is available.
    fn receive(&self, pchan: &dyn PhysicalChannel, size: usize) -> Result<Message> {
        let msg = match self.allocator.allocate(pchan, size) {
            Ok(msg) => msg,
            Err(err @ LinkError::AllocationFailure { .. }) => {
                drain(pchan, size);
                error!(pchan = pchan.name(), size, "allocation failed; arrived message lost");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        if msg.len() != size {
            return Err(LinkError::ShortRead {
                expected: size,
                actual: msg.len(),
            });
        }
        Ok(msg)
    }

    fn receive_export(
        &self,
        pchan: &Arc<dyn PhysicalChannel>,
        vchan: &VirtualChannel,
        size: usize,
    ) -> Result<Dispatch> {
        let max = self.config.max_payload_size;
        if size < EXPORT_PREFIX_SIZE || size > max {
            drain(pchan.as_ref(), size);
            error!(pchan = pchan.name(), size, "export size out of range");
            return Err(ExportError::SizeOutOfRange {
                size,
                min: EXPORT_PREFIX_SIZE,
                max,
            }
            .into());
        }

        let msg = self.receive(pchan.as_ref(), size)?;
        let payload = match msg.as_contiguous() {
            Some(bytes) => std::borrow::Cow::Borrowed(bytes),
            None => std::borrow::Cow::Owned(msg.to_vec()),
        };
        let descriptor =
            match ExportDescriptor::parse(&payload, max, self.config.max_export_payload_count) {
                Ok(descriptor) => descriptor.bind(Arc::clone(pchan)),
                Err(err) => {
                    error!(
                        pchan = pchan.name(),
                        vcid = vchan.id(),
                        session = vchan.session_id(),
                        error = %err,
                        "export rejected"
                    );
                    return Err(err.into());
                }
            };

        let ack = ExportAck {
            export_id: descriptor.export_id(),
            vcid_local: descriptor.vcid_local(),
            vcid_remote: descriptor.vcid_remote(),
        };
        debug!(
            pchan = pchan.name(),
            export_id = ack.export_id,
            pages = descriptor.payload_count(),
            regions = descriptor.regions().len(),
            "export registered"
        );
        vchan.context().push_import(descriptor);

        let mut payload = BytesMut::with_capacity(ExportAck::SIZE);
        ack.encode(&mut payload);
        let header = Header::new(
            PayloadType::ExportAck,
            ExportAck::SIZE as u32,
            ack.vcid_local,
            vchan.session_id(),
        );
        // The export is consumed and registered; a failed ack leaves framing intact.
        if let Err(err) = pchan.send(&header, &payload) {
            warn!(
                pchan = pchan.name(),
                export_id = ack.export_id,
                vcid = ack.vcid_local,
                error = %err,
                "export ack not sent"
            );
        }
        Ok(Dispatch::ExportRegistered {
            export_id: ack.export_id,
        })
    }
}

fn queue(vchan: &VirtualChannel, msg: Message) -> Dispatch {
    let size = msg.len();
    if !vchan.enqueue(msg) {
        return Dispatch::Dropped(DropReason::LocallyClosed {
            vchan_id: vchan.id(),
        });
    }
    Dispatch::Queued {
        vchan_id: vchan.id(),
        size,
    }
}

/// Accept an export acknowledgement of exactly the known record size.
///
/// A shorter record (older peer) is drained and discarded. A longer one is not read at all.
fn receive_export_ack(
    pchan: &dyn PhysicalChannel,
    vchan: &VirtualChannel,
    size: usize,
) -> Result<Dispatch> {
    if size > ExportAck::SIZE {
        error!(
            pchan = pchan.name(),
            size,
            max = ExportAck::SIZE,
            "export ack too large"
        );
        return Err(LinkError::OversizedPayload {
            size,
            max: ExportAck::SIZE,
        });
    }

    let mut raw = [0u8; ExportAck::SIZE];
    let read = pchan.read(&mut raw[..size]);
    if read != size {
        return Err(LinkError::ShortRead {
            expected: size,
            actual: read,
        });
    }
    if size < ExportAck::SIZE {
        warn!(
            pchan = pchan.name(),
            size,
            expected = ExportAck::SIZE,
            "export ack size mismatch; dropped"
        );
        return Err(LinkError::SizeMismatch {
            expected: ExportAck::SIZE,
            actual: size,
        });
    }

    let ack = ExportAck::decode(&raw)?;
    vchan.context().push_export_ack(ack);
    Ok(Dispatch::ExportAckQueued {
        export_id: ack.export_id,
    })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use vmlink_transport::MemoryChannel;
    use vmlink_wire::{ExportHeader, PfnTableHeader, Region};

    use super::*;
    use crate::clock::Clock;
    use crate::config::TransportConfig;
    use crate::context::Context;
    use crate::message::tests::ScriptedAllocator;
    use crate::open::OpenRequestQueue;
    use crate::vchan::RecvFlags;

    struct FixedClock;

    impl Clock for FixedClock {
        fn ticks(&self) -> u64 {
            0x0102_0304_0506_0708
        }

        fn timestamp(&self) -> Duration {
            Duration::new(1_700_000_000, 250_000_000)
        }
    }

    struct Fixture {
        transport: Transport,
        mem: Arc<MemoryChannel>,
        pchan: Arc<dyn PhysicalChannel>,
        vchan: Arc<VirtualChannel>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_transport(Transport::default().with_clock(Arc::new(FixedClock)))
        }

        fn with_transport(transport: Transport) -> Self {
            let mem = Arc::new(MemoryChannel::new("pchan0").with_vmids(1, 2));
            let pchan: Arc<dyn PhysicalChannel> = mem.clone();
            let vchan = transport
                .open_channel(pchan.clone(), 5, 7, 0x25, Arc::new(Context::new()))
                .unwrap();
            Self {
                transport,
                mem,
                pchan,
                vchan,
            }
        }

        fn push(&self, header: Header, payload: &[u8]) {
            self.mem.push(&header, payload).unwrap();
        }

        /// Read the next header and dispatch it.
        fn step(&self) -> Result<Dispatch> {
            let header = self.pchan.read_header()?;
            self.transport.dispatch(&self.pchan, &header)
        }
    }

    fn export_payload(payload_count: u32, nregions: i32, regions: &[Region]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ExportHeader {
            export_id: 42,
            domid_local: 2,
            domid_remote: 1,
            vcid_local: 0x25,
            vcid_remote: 5,
            payload_count,
            ..ExportHeader::default()
        }
        .encode(&mut buf);
        PfnTableHeader {
            first_pfn: 0x8000,
            nregions,
        }
        .encode(&mut buf);
        for region in regions {
            region.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn msg_header(size: u32) -> Header {
        Header::new(PayloadType::Msg, size, 5, 7)
    }

    #[test]
    fn message_is_queued_and_dequeued() {
        let fx = Fixture::new();
        let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        fx.push(msg_header(4096), &payload);

        let receiver = {
            let vchan = Arc::clone(&fx.vchan);
            thread::spawn(move || vchan.dequeue(8192, RecvFlags::BLOCKING))
        };
        assert_eq!(
            fx.step().unwrap(),
            Dispatch::Queued {
                vchan_id: 5,
                size: 4096
            }
        );

        let msg = receiver.join().unwrap().unwrap().unwrap();
        assert_eq!(msg.to_vec(), payload);
        assert_eq!(fx.vchan.queued(), 0);
    }

    #[test]
    fn dispatch_releases_channel_reference() {
        let fx = Fixture::new();
        let before = VirtualChannel::ref_count(&fx.vchan);
        fx.push(msg_header(3), b"abc");
        fx.push(Header::new(PayloadType::Profile, 2, 5, 7), b"xx");
        fx.step().unwrap();
        fx.step().unwrap();
        assert_eq!(VirtualChannel::ref_count(&fx.vchan), before);
    }

    #[test]
    fn unknown_channel_drains_and_framing_survives() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Msg, 100, 9, 7), &[0xAA; 100]);
        fx.push(msg_header(2), b"ok");

        assert!(matches!(
            fx.step(),
            Err(LinkError::ChannelNotFound {
                vchan_id: 9,
                session_id: 7
            })
        ));
        assert_eq!(fx.mem.remaining(), 20 + 2);
        assert!(matches!(fx.step(), Ok(Dispatch::Queued { size: 2, .. })));
        assert_eq!(
            fx.vchan.dequeue(2, RecvFlags::NON_BLOCKING).unwrap().unwrap().to_vec(),
            b"ok"
        );
    }

    #[test]
    fn stale_session_is_not_found() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Msg, 4, 5, 6), b"old!");
        assert!(matches!(fx.step(), Err(LinkError::ChannelNotFound { .. })));
        assert_eq!(fx.mem.remaining(), 0);
    }

    #[test]
    fn malformed_headers_drain_payload() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Unknown(14), 6, 5, 7), b"zzzzzz");
        fx.push(Header::new(PayloadType::Msg, 3, 0, 7), b"abc");
        fx.push(Header::new(PayloadType::Msg, 3, 5, 0), b"abc");

        for _ in 0..3 {
            assert!(matches!(fx.step(), Err(LinkError::MalformedHeader { .. })));
        }
        assert_eq!(fx.mem.remaining(), 0);
    }

    #[test]
    fn remotely_closed_channel_rejects_and_drains() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Close, 0, 5, 7), &[]);
        fx.push(msg_header(5), b"after");

        assert_eq!(fx.step().unwrap(), Dispatch::Closed { vchan_id: 5 });
        assert!(matches!(
            fx.step(),
            Err(LinkError::RemoteClosed { vchan_id: 5 })
        ));
        assert_eq!(fx.mem.remaining(), 0);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let fx = Fixture::new();
        let receiver = {
            let vchan = Arc::clone(&fx.vchan);
            thread::spawn(move || vchan.dequeue(64, RecvFlags::BLOCKING))
        };
        thread::sleep(Duration::from_millis(20));

        fx.push(Header::new(PayloadType::Close, 0, 5, 7), &[]);
        fx.step().unwrap();
        assert!(matches!(
            receiver.join().unwrap(),
            Err(LinkError::RemoteClosed { .. })
        ));
    }

    #[test]
    fn close_after_local_close_unregisters() {
        let fx = Fixture::new();
        fx.transport.close(&fx.vchan).unwrap();
        assert_eq!(fx.transport.channel_count(), 1);

        fx.push(Header::new(PayloadType::Close, 0, 5, 7), &[]);
        fx.step().unwrap();
        assert_eq!(fx.transport.channel_count(), 0);
    }

    #[test]
    fn allocation_failure_drops_only_that_message() {
        let transport = Transport::default()
            .with_allocator(Arc::new(ScriptedAllocator::new(16, usize::MAX)));
        let fx = Fixture::with_transport(transport);
        fx.push(msg_header(64), &[1u8; 64]);
        fx.push(msg_header(4), b"tiny");

        assert!(matches!(
            fx.step(),
            Err(LinkError::AllocationFailure { size: 64 })
        ));
        assert!(matches!(fx.step(), Ok(Dispatch::Queued { size: 4, .. })));
        assert!(!fx.vchan.is_remote_closed());
    }

    #[test]
    fn profile_is_stamped_on_receipt() {
        let fx = Fixture::new();
        let mut stat = BytesMut::new();
        ProfileStat {
            tx_sec: 10,
            tx_usec: 20,
            rx_sec: 0,
            rx_usec: 0,
        }
        .encode(&mut stat);
        fx.push(Header::new(PayloadType::Profile, 32, 5, 7), &stat);

        fx.step().unwrap();
        let msg = fx.vchan.dequeue(32, RecvFlags::NON_BLOCKING).unwrap().unwrap();
        let stat = ProfileStat::decode(&msg.to_vec()).unwrap();
        assert_eq!((stat.tx_sec, stat.tx_usec), (10, 20));
        assert_eq!((stat.rx_sec, stat.rx_usec), (1_700_000_000, 250_000));
    }

    #[test]
    fn short_probes_are_drained_and_dropped() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Profile, 8, 5, 7), &[0u8; 8]);
        fx.push(Header::new(PayloadType::ScheMsg, 4, 5, 7), &[0u8; 4]);

        assert_eq!(
            fx.step().unwrap(),
            Dispatch::Dropped(DropReason::ShortProfile { size: 8 })
        );
        assert_eq!(
            fx.step().unwrap(),
            Dispatch::Dropped(DropReason::ShortScheduleProbe { size: 4 })
        );
        assert_eq!(fx.mem.remaining(), 0);
        assert_eq!(fx.vchan.queued(), 0);
    }

    #[test]
    fn schedule_probe_gets_tick_prefix() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::ScheMsgAck, 12, 5, 7), &[0xFF; 12]);

        fx.step().unwrap();
        let bytes = fx.vchan.dequeue(12, RecvFlags::NON_BLOCKING).unwrap().unwrap().to_vec();
        assert_eq!(&bytes[..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[8..], &[0xFF; 4]);
    }

    #[test]
    fn valid_export_is_registered_and_acked() {
        let fx = Fixture::new();
        let regions = [
            Region {
                page_count: 3,
                gap: 1,
            },
            Region {
                page_count: 2,
                gap: 0,
            },
        ];
        let payload = export_payload(5, 2, &regions);
        fx.push(Header::new(PayloadType::Export, payload.len() as u32, 5, 7), &payload);

        assert_eq!(
            fx.step().unwrap(),
            Dispatch::ExportRegistered { export_id: 42 }
        );
        let ctx = fx.vchan.context();
        assert_eq!(ctx.pending_imports(), vec![42]);
        let desc = ctx.take_import(42).unwrap();
        assert_eq!((desc.domid_local(), desc.domid_remote()), (1, 2));
        assert_eq!(desc.page_runs(), vec![(0x8000, 3), (0x8004, 2)]);

        let sent = fx.mem.take_sent();
        assert_eq!(sent.len(), 1);
        let (header, body) = &sent[0];
        assert_eq!(header.payload_type, PayloadType::ExportAck);
        assert_eq!((header.vchan_id, header.session_id), (0x25, 7));
        let ack = ExportAck::decode(body).unwrap();
        assert_eq!((ack.export_id, ack.vcid_local, ack.vcid_remote), (42, 0x25, 5));
    }

    /// Memory channel whose sends always fail, as a full socket with a write timeout would.
    struct StalledSend(MemoryChannel);

    impl PhysicalChannel for StalledSend {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn read_header(&self) -> vmlink_transport::Result<Header> {
            self.0.read_header()
        }

        fn read(&self, dst: &mut [u8]) -> usize {
            self.0.read(dst)
        }

        fn send(&self, _header: &Header, _payload: &[u8]) -> vmlink_transport::Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock).into())
        }

        fn sequence_rx(&self) -> u32 {
            self.0.sequence_rx()
        }

        fn vmid_local(&self) -> u32 {
            self.0.vmid_local()
        }

        fn vmid_remote(&self) -> u32 {
            self.0.vmid_remote()
        }
    }

    #[test]
    fn failed_export_ack_does_not_stop_the_pump() {
        let transport = Transport::default();
        let stalled = Arc::new(StalledSend(MemoryChannel::new("stalled").with_vmids(1, 2)));
        let pchan: Arc<dyn PhysicalChannel> = stalled.clone();
        let vchan = transport
            .open_channel(pchan.clone(), 5, 7, 0x25, Arc::new(Context::new()))
            .unwrap();

        let payload = export_payload(
            1,
            1,
            &[Region {
                page_count: 1,
                gap: 0,
            }],
        );
        stalled
            .0
            .push(&Header::new(PayloadType::Export, payload.len() as u32, 5, 7), &payload)
            .unwrap();
        stalled.0.push(&msg_header(2), b"ok").unwrap();

        transport.run(pchan).unwrap();

        assert_eq!(vchan.context().pending_imports(), vec![42]);
        let msg = vchan.dequeue(16, RecvFlags::NON_BLOCKING).unwrap().unwrap();
        assert_eq!(msg.to_vec(), b"ok");
    }

    #[test]
    fn message_for_locally_closed_channel_is_dropped() {
        let fx = Fixture::new();
        assert!(fx.vchan.close_local());
        fx.push(msg_header(3), b"abc");

        assert_eq!(
            fx.step().unwrap(),
            Dispatch::Dropped(DropReason::LocallyClosed { vchan_id: 5 })
        );
        assert_eq!(fx.mem.remaining(), 0);
        assert_eq!(fx.vchan.queued(), 0);
    }

    #[test]
    fn export_with_more_regions_than_pages_is_rejected() {
        let fx = Fixture::new();
        let regions = [Region {
            page_count: 1,
            gap: 0,
        }; 3];
        let payload = export_payload(2, 3, &regions);
        fx.push(Header::new(PayloadType::Export, payload.len() as u32, 5, 7), &payload);
        fx.push(msg_header(1), b"z");

        assert!(matches!(
            fx.step(),
            Err(LinkError::ExportValidation(ExportError::RegionsExceedPayload {
                nregions: 3,
                payload_count: 2
            }))
        ));
        assert_eq!(fx.vchan.context().import_count(), 0);
        assert!(fx.mem.sent().is_empty());
        assert!(matches!(fx.step(), Ok(Dispatch::Queued { size: 1, .. })));
    }

    #[test]
    fn undersized_export_is_drained() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::Export, 10, 5, 7), &[0u8; 10]);
        assert!(matches!(
            fx.step(),
            Err(LinkError::ExportValidation(ExportError::SizeOutOfRange { size: 10, .. }))
        ));
        assert_eq!(fx.mem.remaining(), 0);
    }

    #[test]
    fn export_ack_is_queued_for_exporter() {
        let fx = Fixture::new();
        let mut body = BytesMut::new();
        ExportAck {
            export_id: 8,
            vcid_local: 5,
            vcid_remote: 0x25,
        }
        .encode(&mut body);
        fx.push(Header::new(PayloadType::ExportAck, 16, 5, 7), &body);

        assert_eq!(fx.step().unwrap(), Dispatch::ExportAckQueued { export_id: 8 });
        assert!(fx.vchan.context().try_take_export_ack(8, 5).is_some());
    }

    #[test]
    fn short_export_ack_is_drained_and_discarded() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::ExportAck, 12, 5, 7), &[0u8; 12]);
        fx.push(msg_header(1), b"n");

        assert!(matches!(
            fx.step(),
            Err(LinkError::SizeMismatch {
                expected: 16,
                actual: 12
            })
        ));
        assert_eq!(fx.vchan.context().export_ack_count(), 0);
        assert!(matches!(fx.step(), Ok(Dispatch::Queued { .. })));
    }

    #[test]
    fn oversized_export_ack_is_fatal_and_unread() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::ExportAck, 20, 5, 7), &[0u8; 20]);

        let err = fx.step().unwrap_err();
        assert!(err.breaks_framing());
        assert_eq!(fx.mem.remaining(), 20);
    }

    #[test]
    fn open_requests_go_to_collaborator() {
        let open = Arc::new(OpenRequestQueue::new());
        let fx = Fixture::with_transport(Transport::default().with_open_handshake(open.clone()));
        let mut body = BytesMut::new();
        OpenRequest {
            vchan_id: 0x30,
            sub_id: 4,
            open_id: 1,
            ver_fe: 1,
            ver_be: 1,
        }
        .encode(&mut body);
        // Open traffic is routed without a channel lookup.
        fx.push(Header::new(PayloadType::Init, 24, 0, 0), &body);

        assert_eq!(
            fx.step().unwrap(),
            Dispatch::OpenForwarded(PayloadType::Init)
        );
        assert_eq!(open.try_take().unwrap().request.sub_id, 4);
    }

    #[test]
    fn malformed_open_is_drained() {
        let fx = Fixture::new();
        fx.push(Header::new(PayloadType::InitAck, 30, 0, 0), &[0u8; 30]);
        fx.push(msg_header(1), b"q");

        assert!(matches!(
            fx.step(),
            Err(LinkError::MalformedOpen {
                size: 30,
                expected: 24,
                ..
            })
        ));
        assert!(matches!(fx.step(), Ok(Dispatch::Queued { .. })));
    }

    #[test]
    fn scattered_export_still_parses() {
        let config = TransportConfig {
            page_size: 32,
            ..TransportConfig::default()
        };
        let transport = Transport::new(config)
            .with_allocator(Arc::new(ScriptedAllocator::new(32, usize::MAX)));
        let fx = Fixture::with_transport(transport);
        let payload = export_payload(
            1,
            1,
            &[Region {
                page_count: 1,
                gap: 0,
            }],
        );
        fx.push(Header::new(PayloadType::Export, payload.len() as u32, 5, 7), &payload);

        assert_eq!(
            fx.step().unwrap(),
            Dispatch::ExportRegistered { export_id: 42 }
        );
    }
}
