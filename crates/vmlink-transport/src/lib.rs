//! Physical channel abstraction for vmlink.
//!
//! A physical channel is the single ordered byte stream between two execution domains. This
//! crate defines the [`PhysicalChannel`] trait consumed by `vmlink-core` and ships three
//! implementations:
//! - [`StreamChannel`] over any blocking `Read`/`Write` pair
//! - [`UnixChannel`] / [`UnixSocketListener`] over Unix domain sockets
//! - [`MemoryChannel`], an in-memory stream for loopback and tests

pub mod error;
pub mod memory;
pub mod stream;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::MemoryChannel;
pub use stream::StreamChannel;
pub use traits::PhysicalChannel;

#[cfg(unix)]
pub use stream::UnixChannel;
#[cfg(unix)]
pub use uds::{connect_stream, UnixSocketListener};
