use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use vmlink_transport::PhysicalChannel;
use vmlink_wire::{Header, PayloadType};

use crate::context::Context;
use crate::error::{LinkError, Result};
use crate::message::Message;

/// Receive flags for [`VirtualChannel::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvFlags(u32);

impl RecvFlags {
    /// Wait for a message; the wait can be interrupted.
    pub const BLOCKING: Self = Self(0);
    /// Return immediately when the queue is empty.
    pub const NON_BLOCKING: Self = Self(1);
    /// Ignore [`VirtualChannel::interrupt`] while waiting.
    pub const UNINTERRUPTIBLE: Self = Self(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_blocking(self) -> bool {
        !self.contains(Self::NON_BLOCKING)
    }

    pub fn is_interruptible(self) -> bool {
        !self.contains(Self::UNINTERRUPTIBLE)
    }
}

impl BitOr for RecvFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Default)]
struct RxState {
    queue: VecDeque<Message>,
    remote_closed: bool,
    local_closed: bool,
    interrupts: u64,
}

/// One logical endpoint multiplexed over a physical channel.
///
/// Received messages queue here in arrival order until a consumer dequeues them. Shared as
/// `Arc<VirtualChannel>`; the registry, the dispatcher and consumers each hold a clone.
pub struct VirtualChannel {
    id: u32,
    session_id: u32,
    otherend_id: u32,
    pchan: Arc<dyn PhysicalChannel>,
    context: Arc<Context>,
    rx: Mutex<RxState>,
    rx_ready: Condvar,
}

impl VirtualChannel {
    pub(crate) fn new(
        pchan: Arc<dyn PhysicalChannel>,
        id: u32,
        session_id: u32,
        otherend_id: u32,
        context: Arc<Context>,
    ) -> Self {
        Self {
            id,
            session_id,
            otherend_id,
            pchan,
            context,
            rx: Mutex::new(RxState::default()),
            rx_ready: Condvar::new(),
        }
    }

    /// Local channel id; incoming headers address it.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Channel id at the remote end; outgoing headers address it.
    pub fn otherend_id(&self) -> u32 {
        self.otherend_id
    }

    pub fn pchan(&self) -> &Arc<dyn PhysicalChannel> {
        &self.pchan
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Number of live references, including the registry's.
    pub fn ref_count(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }

    /// Take the next message if `capacity` can hold it.
    ///
    /// Returns `Ok(None)` when a non-blocking call finds the queue empty on an open channel.
    /// A message that does not fit stays queued and `BufferTooSmall` reports its size.
    pub fn dequeue(&self, capacity: usize, flags: RecvFlags) -> Result<Option<Message>> {
        self.dequeue_until(capacity, flags, None)
    }

    /// [`dequeue`](Self::dequeue) with a bound on the blocking wait.
    pub fn dequeue_timeout(
        &self,
        capacity: usize,
        flags: RecvFlags,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        self.dequeue_until(capacity, flags, Some((Instant::now() + timeout, timeout)))
    }

    fn dequeue_until(
        &self,
        capacity: usize,
        flags: RecvFlags,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Option<Message>> {
        let mut rx = self.rx();

        if flags.is_blocking() {
            let generation = rx.interrupts;
            while rx.queue.is_empty() && !rx.remote_closed && !rx.local_closed {
                if flags.is_interruptible() && rx.interrupts != generation {
                    return Err(LinkError::Interrupted);
                }
                rx = match deadline {
                    None => self
                        .rx_ready
                        .wait(rx)
                        .unwrap_or_else(PoisonError::into_inner),
                    Some((deadline, timeout)) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(LinkError::TimedOut(timeout));
                        }
                        self.rx_ready
                            .wait_timeout(rx, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                };
            }
        }

        if rx.local_closed {
            return Err(LinkError::Closed { vchan_id: self.id });
        }

        match rx.queue.front() {
            Some(msg) if msg.len() > capacity => Err(LinkError::BufferTooSmall {
                required: msg.len(),
                capacity,
            }),
            Some(_) => {
                let msg = rx.queue.pop_front();
                trace!(vcid = self.id, remaining = rx.queue.len(), "message dequeued");
                Ok(msg)
            }
            None if rx.remote_closed => Err(LinkError::RemoteClosed { vchan_id: self.id }),
            None => Ok(None),
        }
    }

    /// Queue a received message and wake one waiting receiver.
    ///
    /// Returns false, dropping `msg`, when the local end is already closed.
    pub fn enqueue(&self, msg: Message) -> bool {
        let mut rx = self.rx();
        if rx.local_closed {
            debug!(vcid = self.id, size = msg.len(), "dropping message for closed channel");
            return false;
        }
        rx.queue.push_back(msg);
        drop(rx);
        self.rx_ready.notify_one();
        true
    }

    /// Messages waiting to be dequeued.
    pub fn queued(&self) -> usize {
        self.rx().queue.len()
    }

    /// Record a remote CLOSE and wake every waiter.
    pub fn mark_remote_closed(&self) {
        self.rx().remote_closed = true;
        self.rx_ready.notify_all();
    }

    pub fn is_remote_closed(&self) -> bool {
        self.rx().remote_closed
    }

    /// Close the local end: queued messages are discarded and every waiter returns `Closed`.
    ///
    /// Returns false if the channel was already closed locally.
    pub fn close_local(&self) -> bool {
        let mut rx = self.rx();
        if rx.local_closed {
            return false;
        }
        rx.local_closed = true;
        rx.queue.clear();
        drop(rx);
        self.rx_ready.notify_all();
        true
    }

    pub fn is_local_closed(&self) -> bool {
        self.rx().local_closed
    }

    /// Wake interruptible waiters with `Interrupted`.
    pub fn interrupt(&self) {
        self.rx().interrupts += 1;
        self.rx_ready.notify_all();
    }

    /// Send one frame of `payload_type` to the remote end.
    pub fn send(&self, payload_type: PayloadType, payload: &[u8]) -> Result<()> {
        let size = u32::try_from(payload.len()).map_err(|_| LinkError::OversizedPayload {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let header = Header::new(payload_type, size, self.otherend_id, self.session_id);
        self.pchan.send(&header, payload)?;
        Ok(())
    }

    fn rx(&self) -> MutexGuard<'_, RxState> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("otherend_id", &self.otherend_id)
            .field("pchan", &self.pchan.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use vmlink_transport::MemoryChannel;

    use super::*;

    fn channel() -> Arc<VirtualChannel> {
        let pchan: Arc<dyn PhysicalChannel> = Arc::new(MemoryChannel::new("mem"));
        Arc::new(VirtualChannel::new(pchan, 5, 7, 9, Arc::new(Context::new())))
    }

    fn msg(bytes: &[u8]) -> Message {
        Message::from_vec(bytes.to_vec(), 0)
    }

    #[test]
    fn empty_open_channel_returns_none() {
        let vchan = channel();
        assert!(vchan.dequeue(64, RecvFlags::NON_BLOCKING).unwrap().is_none());
    }

    #[test]
    fn small_buffer_leaves_message_queued() {
        let vchan = channel();
        vchan.enqueue(msg(b"0123456789"));

        match vchan.dequeue(4, RecvFlags::NON_BLOCKING) {
            Err(LinkError::BufferTooSmall {
                required: 10,
                capacity: 4,
            }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(vchan.queued(), 1);

        let got = vchan.dequeue(10, RecvFlags::NON_BLOCKING).unwrap().unwrap();
        assert_eq!(got.to_vec(), b"0123456789");
        assert_eq!(vchan.queued(), 0);
    }

    #[test]
    fn queued_messages_drain_before_remote_closed() {
        let vchan = channel();
        vchan.enqueue(msg(b"a"));
        vchan.enqueue(msg(b"b"));
        vchan.mark_remote_closed();

        assert_eq!(vchan.dequeue(8, RecvFlags::BLOCKING).unwrap().unwrap().to_vec(), b"a");
        assert_eq!(vchan.dequeue(8, RecvFlags::BLOCKING).unwrap().unwrap().to_vec(), b"b");
        assert!(matches!(
            vchan.dequeue(8, RecvFlags::BLOCKING),
            Err(LinkError::RemoteClosed { vchan_id: 5 })
        ));
    }

    #[test]
    fn blocked_receiver_wakes_on_message() {
        let vchan = channel();
        let receiver = {
            let vchan = Arc::clone(&vchan);
            thread::spawn(move || vchan.dequeue(4096, RecvFlags::BLOCKING))
        };

        thread::sleep(Duration::from_millis(20));
        vchan.enqueue(msg(&[1u8; 4096]));

        let got = receiver.join().unwrap().unwrap().unwrap();
        assert_eq!(got.len(), 4096);
        assert_eq!(vchan.queued(), 0);
    }

    #[test]
    fn remote_close_wakes_blocked_receiver() {
        let vchan = channel();
        let receiver = {
            let vchan = Arc::clone(&vchan);
            thread::spawn(move || vchan.dequeue(64, RecvFlags::BLOCKING))
        };

        thread::sleep(Duration::from_millis(20));
        vchan.mark_remote_closed();

        assert!(matches!(
            receiver.join().unwrap(),
            Err(LinkError::RemoteClosed { .. })
        ));
    }

    #[test]
    fn interrupt_only_reaches_interruptible_waiters() {
        let vchan = channel();
        let interruptible = {
            let vchan = Arc::clone(&vchan);
            thread::spawn(move || vchan.dequeue(64, RecvFlags::BLOCKING))
        };
        let steady = {
            let vchan = Arc::clone(&vchan);
            thread::spawn(move || {
                vchan.dequeue_timeout(64, RecvFlags::UNINTERRUPTIBLE, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(20));
        vchan.interrupt();
        let err = interruptible.join().unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, LinkError::Interrupted));

        vchan.enqueue(msg(b"x"));
        assert_eq!(steady.join().unwrap().unwrap().unwrap().to_vec(), b"x");
    }

    #[test]
    fn enqueue_after_local_close_is_refused() {
        let vchan = channel();
        assert!(vchan.enqueue(msg(b"kept")));
        assert!(vchan.close_local());
        assert!(!vchan.enqueue(msg(b"late")));
        assert_eq!(vchan.queued(), 0);
    }

    #[test]
    fn local_close_wakes_waiters() {
        let vchan = channel();
        let receiver = {
            let vchan = Arc::clone(&vchan);
            thread::spawn(move || vchan.dequeue(64, RecvFlags::UNINTERRUPTIBLE))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(vchan.close_local());
        assert!(!vchan.close_local());
        assert!(matches!(
            receiver.join().unwrap(),
            Err(LinkError::Closed { vchan_id: 5 })
        ));
    }

    #[test]
    fn dequeue_timeout_expires() {
        let vchan = channel();
        assert!(matches!(
            vchan.dequeue_timeout(64, RecvFlags::BLOCKING, Duration::from_millis(10)),
            Err(LinkError::TimedOut(_))
        ));
    }

    #[test]
    fn send_addresses_remote_end() {
        let pchan = Arc::new(MemoryChannel::new("mem"));
        let vchan = VirtualChannel::new(
            pchan.clone() as Arc<dyn PhysicalChannel>,
            5,
            7,
            9,
            Arc::new(Context::new()),
        );
        vchan.send(PayloadType::Msg, b"hi").unwrap();

        let sent = pchan.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.vchan_id, 9);
        assert_eq!(sent[0].0.session_id, 7);
        assert_eq!(sent[0].0.size, 2);
        assert_eq!(sent[0].1, b"hi");
    }
}
