use vmlink_wire::Header;

use crate::error::Result;

/// One ordered, reliable byte stream connecting two execution domains.
///
/// The receive side is driven by a single pump: [`read_header`](Self::read_header) yields the
/// next header and the dispatcher then consumes exactly `header.size` bytes through
/// [`read`](Self::read) before asking for the next header. Reads are destructive; bytes taken from
/// the stream can never be pushed back.
///
/// `send` may be called from any thread; implementations serialize whole frames.
pub trait PhysicalChannel: Send + Sync {
    /// Diagnostic name used in logs.
    fn name(&self) -> &str;

    /// Read and decode the next header (blocking).
    fn read_header(&self) -> Result<Header>;

    /// Fill `dst` from the payload stream and return the number of bytes read.
    ///
    /// A short count means the stream ended or failed; the failure is logged by the channel.
    fn read(&self, dst: &mut [u8]) -> usize;

    /// Send one frame. The header's size is taken from `payload`.
    fn send(&self, header: &Header, payload: &[u8]) -> Result<()>;

    /// Sequence number of the most recently received header.
    fn sequence_rx(&self) -> u32;

    /// Authoritative id of the local domain.
    fn vmid_local(&self) -> u32;

    /// Authoritative id of the remote domain.
    fn vmid_remote(&self) -> u32;
}
