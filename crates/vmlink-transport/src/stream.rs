use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{trace, warn};
use vmlink_wire::{FrameWriter, Header, HeaderReader, WireConfig, WireError};

use crate::error::Result;
use crate::traits::PhysicalChannel;

/// Physical channel over a pair of blocking byte streams.
///
/// The read half is owned by the receive pump; the write half is shared by every sender and
/// guarded by its own lock, so a blocked read never stalls a send.
pub struct StreamChannel<R, W> {
    name: String,
    vmid_local: u32,
    vmid_remote: u32,
    reader: Mutex<HeaderReader<R>>,
    writer: Mutex<FrameWriter<W>>,
    sequence_rx: AtomicU32,
    sequence_tx: AtomicU32,
}

/// Stream channel over a connected Unix domain socket.
#[cfg(unix)]
pub type UnixChannel = StreamChannel<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream>;

impl<R: Read, W: Write> StreamChannel<R, W> {
    /// Create a channel with default configuration and domain ids of zero.
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self::with_config(name, reader, writer, WireConfig::default())
    }

    /// Create a channel with explicit wire configuration.
    pub fn with_config(name: impl Into<String>, reader: R, writer: W, config: WireConfig) -> Self {
        Self {
            name: name.into(),
            vmid_local: 0,
            vmid_remote: 0,
            reader: Mutex::new(HeaderReader::with_config(reader, config.clone())),
            writer: Mutex::new(FrameWriter::with_config(writer, config)),
            sequence_rx: AtomicU32::new(0),
            sequence_tx: AtomicU32::new(0),
        }
    }

    /// Set the authoritative local and remote domain ids.
    pub fn with_vmids(mut self, local: u32, remote: u32) -> Self {
        self.vmid_local = local;
        self.vmid_remote = remote;
        self
    }

    fn reader(&self) -> MutexGuard<'_, HeaderReader<R>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, FrameWriter<W>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(unix)]
impl UnixChannel {
    /// Wrap a connected Unix stream, applying the configured timeouts.
    pub fn from_unix(
        name: impl Into<String>,
        stream: std::os::unix::net::UnixStream,
        config: WireConfig,
    ) -> Result<Self> {
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        let reader = stream.try_clone()?;
        Ok(Self::with_config(name, reader, stream, config))
    }
}

impl<R, W> PhysicalChannel for StreamChannel<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn read_header(&self) -> Result<Header> {
        let header = self.reader().read_header()?;
        self.sequence_rx.store(header.sequence, Ordering::Release);
        trace!(
            pchan = %self.name,
            payload_type = %header.payload_type,
            size = header.size,
            vcid = header.vchan_id,
            session = header.session_id,
            sequence = header.sequence,
            "header received"
        );
        Ok(header)
    }

    fn read(&self, dst: &mut [u8]) -> usize {
        match self.reader().read_payload(dst) {
            Ok(n) => {
                if n < dst.len() {
                    warn!(pchan = %self.name, wanted = dst.len(), got = n, "payload stream ended early");
                }
                n
            }
            Err(WireError::PartialPayload { filled, source }) => {
                warn!(
                    pchan = %self.name,
                    wanted = dst.len(),
                    got = filled,
                    error = %source,
                    "payload read failed"
                );
                filled
            }
            Err(err) => {
                warn!(pchan = %self.name, error = %err, "payload read failed");
                0
            }
        }
    }

    fn send(&self, header: &Header, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer();
        let sequence = self.sequence_tx.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        writer.send(&header.with_sequence(sequence), payload)?;
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

impl<R, W> std::fmt::Debug for StreamChannel<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("name", &self.name)
            .field("vmid_local", &self.vmid_local)
            .field("vmid_remote", &self.vmid_remote)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    use vmlink_wire::PayloadType;

    use super::*;

    #[test]
    fn send_stamps_increasing_sequence() {
        let (left, right) = UnixStream::pair().unwrap();
        let tx = UnixChannel::from_unix("tx", left, WireConfig::default()).unwrap();
        let rx = UnixChannel::from_unix("rx", right, WireConfig::default()).unwrap();

        tx.send(&Header::new(PayloadType::Msg, 0, 5, 7), b"first")
            .unwrap();
        tx.send(&Header::new(PayloadType::Msg, 0, 5, 7), b"second")
            .unwrap();

        let h1 = rx.read_header().unwrap();
        let mut p1 = vec![0u8; h1.payload_len()];
        assert_eq!(rx.read(&mut p1), 5);
        assert_eq!(rx.sequence_rx(), 1);

        let h2 = rx.read_header().unwrap();
        let mut p2 = vec![0u8; h2.payload_len()];
        assert_eq!(rx.read(&mut p2), 6);
        assert_eq!(rx.sequence_rx(), 2);
        assert_eq!(&p2, b"second");
    }

    #[test]
    fn closed_stream_reports_closed() {
        let channel = StreamChannel::new("empty", Cursor::new(Vec::<u8>::new()), Vec::<u8>::new());
        let err = channel.read_header().unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn short_payload_read_returns_partial_count() {
        let channel = StreamChannel::new("short", Cursor::new(b"abc".to_vec()), Vec::<u8>::new());
        let mut dst = [0u8; 8];
        assert_eq!(channel.read(&mut dst), 3);
        assert_eq!(&dst[..3], b"abc");
    }

    #[test]
    fn failed_payload_read_returns_bytes_consumed() {
        struct ResetAfter(Cursor<Vec<u8>>);

        impl Read for ResetAfter {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.read(buf)? {
                    0 => Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
                    n => Ok(n),
                }
            }
        }

        let channel = StreamChannel::new(
            "reset",
            ResetAfter(Cursor::new(b"abcde".to_vec())),
            Vec::<u8>::new(),
        );
        let mut dst = [0u8; 8];
        assert_eq!(channel.read(&mut dst), 5);
        assert_eq!(&dst[..5], b"abcde");
    }

    #[test]
    fn vmids_are_reported() {
        let channel = StreamChannel::new("ids", Cursor::new(Vec::<u8>::new()), Vec::<u8>::new())
            .with_vmids(2, 3);
        assert_eq!((channel.vmid_local(), channel.vmid_remote()), (2, 3));
    }
}
