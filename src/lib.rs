//! pktlink: a point-to-point packet link
//!
//! A sliding-window ARQ link layer multiplexing up to 16 logical channels
//! over one serial line. Frames carry mod-16 sequence numbers and CRC-16
//! checks; RR/RNR/REJECT frames drive flow control, and RESTART/RESET
//! handshakes recover the whole link or a single channel.
//!
//! [`LinkEngine`] is the synchronous protocol core. The [`transport`]
//! module runs it inside a tokio task over a serial port or any async
//! byte stream.
pub mod core;

pub mod buffer;
pub mod link;
pub mod protocol;
pub mod timer;
pub mod transport;
pub mod util;

// Re-export commonly used items
pub use crate::core::{ChannelId, Error, LinkConfig, Result, Role, Seq};
pub use crate::link::{Delivered, LinkEngine, LinkEvent, LinkStats};
pub use crate::protocol::{Cause, Diagnostic};
pub use crate::transport::{Link, LinkHandle, Notice};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
