//! Virtual channel multiplexing over a physical channel.
//!
//! A [`Transport`] owns the registry of open virtual channels. One receive pump per physical
//! channel reads headers and [`dispatch`](Transport::dispatch)es them: data messages land on the
//! addressed [`VirtualChannel`]'s queue, memory grants land in the session's [`Context`], and
//! open-handshake traffic goes to the [`OpenHandshake`] collaborator.
//!
//! Framing is preserved on every rejection path: a header that is refused still has its declared
//! payload drained from the stream, so the next header parses cleanly.

pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod message;
pub mod open;
pub mod transport;
pub mod vchan;

pub use clock::{Clock, SystemClock};
pub use config::{TransportConfig, DEFAULT_PAGE_SIZE, MAX_EXPORT_PAYLOAD_COUNT};
pub use context::Context;
pub use dispatch::{Dispatch, DropReason};
pub use error::{LinkError, Result};
pub use export::{ExportDescriptor, ExportError, ExportRequest};
pub use message::{BufferAllocator, Message, MessageAllocator, SystemAllocator};
pub use open::{OpenHandshake, OpenRequestQueue, PendingOpen};
pub use transport::Transport;
pub use vchan::{RecvFlags, VirtualChannel};
