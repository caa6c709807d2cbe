//! Core types and traits for the packet link
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    ChannelId,
    LinkConfig,
    Role,
    Seq,
    SerialConfig,
};

/// Number of logical channels multiplexed on the line
pub const MAX_CHANNELS: usize = 16;

/// Maximum extra data carried by one frame
pub const MAX_EXTRA_DATA: usize = 61;

/// Number of timer tick granularities
pub const GRANULARITIES: usize = 3;
