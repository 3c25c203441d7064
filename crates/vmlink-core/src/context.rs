use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use vmlink_wire::ExportAck;

use crate::error::{LinkError, Result};
use crate::export::ExportDescriptor;

#[derive(Debug, Default)]
struct Imports {
    pending: VecDeque<ExportDescriptor>,
    total: u64,
}

/// Per-session state shared by the virtual channels a local user opens.
///
/// Holds grants received from the remote side (the pending-import list) and acknowledgements of
/// grants this side sent (the export-ack queue). Each has its own lock.
#[derive(Debug, Default)]
pub struct Context {
    imports: Mutex<Imports>,
    export_acks: Mutex<VecDeque<ExportAck>>,
    ack_ready: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validated export to the pending-import list.
    pub fn push_import(&self, descriptor: ExportDescriptor) {
        let mut imports = self.imports();
        imports.pending.push_back(descriptor);
        imports.total += 1;
    }

    /// Claim a pending import by export id.
    pub fn take_import(&self, export_id: u32) -> Option<ExportDescriptor> {
        let mut imports = self.imports();
        let index = imports
            .pending
            .iter()
            .position(|desc| desc.export_id() == export_id)?;
        imports.pending.remove(index)
    }

    /// Imports received over the lifetime of this context.
    pub fn import_count(&self) -> u64 {
        self.imports().total
    }

    /// Export ids still waiting to be claimed, oldest first.
    pub fn pending_imports(&self) -> Vec<u32> {
        self.imports()
            .pending
            .iter()
            .map(ExportDescriptor::export_id)
            .collect()
    }

    /// Queue an acknowledgement and wake exporters waiting on this context.
    pub fn push_export_ack(&self, ack: ExportAck) {
        self.acks().push_back(ack);
        // Waiters filter by export id, so every waiter must re-check.
        self.ack_ready.notify_all();
    }

    /// Remove the acknowledgement for `export_id` on `vcid_local`, if it has arrived.
    pub fn try_take_export_ack(&self, export_id: u32, vcid_local: u32) -> Option<ExportAck> {
        take_matching(&mut self.acks(), export_id, vcid_local)
    }

    /// Block until the acknowledgement for `export_id` on `vcid_local` arrives.
    pub fn wait_export_ack(
        &self,
        export_id: u32,
        vcid_local: u32,
        timeout: Duration,
    ) -> Result<ExportAck> {
        let deadline = Instant::now() + timeout;
        let mut acks = self.acks();
        loop {
            if let Some(ack) = take_matching(&mut acks, export_id, vcid_local) {
                return Ok(ack);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(export_id, vcid = vcid_local, "export ack wait timed out");
                return Err(LinkError::TimedOut(timeout));
            }
            acks = self
                .ack_ready
                .wait_timeout(acks, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Acknowledgements received but not yet consumed.
    pub fn export_ack_count(&self) -> usize {
        self.acks().len()
    }

    fn imports(&self) -> MutexGuard<'_, Imports> {
        self.imports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acks(&self) -> MutexGuard<'_, VecDeque<ExportAck>> {
        self.export_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_matching(
    acks: &mut VecDeque<ExportAck>,
    export_id: u32,
    vcid_local: u32,
) -> Option<ExportAck> {
    let index = acks
        .iter()
        .position(|ack| ack.export_id == export_id && ack.vcid_local == vcid_local)?;
    acks.remove(index)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::BytesMut;
    use vmlink_wire::{Region, DEFAULT_MAX_PAYLOAD};

    use super::*;
    use crate::config::MAX_EXPORT_PAYLOAD_COUNT;
    use crate::export::ExportRequest;

    fn descriptor(export_id: u32) -> ExportDescriptor {
        let mut buf = BytesMut::new();
        ExportRequest::new(
            export_id,
            0,
            vec![Region {
                page_count: 1,
                gap: 0,
            }],
        )
        .encode((1, 2), (3, 4), &mut buf);
        ExportDescriptor::parse(&buf, DEFAULT_MAX_PAYLOAD, MAX_EXPORT_PAYLOAD_COUNT).unwrap()
    }

    fn ack(export_id: u32, vcid_local: u32) -> ExportAck {
        ExportAck {
            export_id,
            vcid_local,
            vcid_remote: 0x99,
        }
    }

    #[test]
    fn imports_are_claimed_by_id() {
        let ctx = Context::new();
        ctx.push_import(descriptor(1));
        ctx.push_import(descriptor(2));
        assert_eq!(ctx.pending_imports(), vec![1, 2]);

        assert_eq!(ctx.take_import(2).unwrap().export_id(), 2);
        assert!(ctx.take_import(2).is_none());
        assert_eq!(ctx.pending_imports(), vec![1]);
        assert_eq!(ctx.import_count(), 2);
    }

    #[test]
    fn try_take_matches_export_and_channel() {
        let ctx = Context::new();
        ctx.push_export_ack(ack(5, 0x10));
        assert!(ctx.try_take_export_ack(5, 0x11).is_none());
        assert_eq!(ctx.try_take_export_ack(5, 0x10), Some(ack(5, 0x10)));
        assert_eq!(ctx.export_ack_count(), 0);
    }

    #[test]
    fn wait_times_out_without_ack() {
        let ctx = Context::new();
        ctx.push_export_ack(ack(1, 0x10));
        let err = ctx
            .wait_export_ack(2, 0x10, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, LinkError::TimedOut(_)));
        assert_eq!(ctx.export_ack_count(), 1);
    }

    #[test]
    fn wait_wakes_on_matching_ack() {
        let ctx = Arc::new(Context::new());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || ctx.wait_export_ack(7, 0x10, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        ctx.push_export_ack(ack(6, 0x10));
        ctx.push_export_ack(ack(7, 0x10));

        assert_eq!(waiter.join().unwrap().unwrap(), ack(7, 0x10));
        assert_eq!(ctx.export_ack_count(), 1);
    }
}
