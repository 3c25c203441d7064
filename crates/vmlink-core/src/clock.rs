use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time sources used to stamp latency probes on arrival.
pub trait Clock: Send + Sync {
    /// Monotonic tick counter written into SCHE_MSG / SCHE_MSG_ACK payloads.
    fn ticks(&self) -> u64;

    /// Receipt time written into PROFILE payloads.
    fn timestamp(&self) -> Duration;
}

/// Host clocks: `CLOCK_MONOTONIC` nanoseconds for ticks, wall time for timestamps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[cfg(unix)]
    fn ticks(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always available.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }

    #[cfg(not(unix))]
    fn ticks(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    fn timestamp(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}
