//! Inter-domain message transport.
//!
//! vmlink multiplexes many virtual channels over one ordered byte stream between two execution
//! domains, with a memory-grant handshake (export / export-ack) alongside ordinary messages.
//!
//! # Crate Structure
//!
//! - [`wire`]: header layout, payload records, header reader and frame writer
//! - [`transport`]: the physical channel trait plus stream, Unix socket and in-memory channels
//! - [`link`]: virtual channels, dispatch, message allocation and the export registry

/// Re-export wire types.
pub mod wire {
    pub use vmlink_wire::*;
}

/// Re-export physical channel types.
pub mod transport {
    pub use vmlink_transport::*;
}

/// Re-export dispatch and virtual channel types.
pub mod link {
    pub use vmlink_core::*;
}
