//! Wire protocol module
//!
//! This module defines the link frame format, its CRC, and the streaming
//! codec that assembles frames out of a raw byte stream.
//!
//! ```text
//! [0] start marker 0x7E
//! [1] extra data length (0..=61)
//! [2] channel (bits 0-3) | C-bit 0x10 | Q-bit 0x20 | reserved 0xC0
//! [3] N(S) low nibble | N(R) high nibble
//! [4] function: control type, or session packet type for data
//! [5..7] CRC-16 over [1..5], high byte first
//! [7..7+len] extra data, then its own CRC-16 when len > 0
//! ```

pub mod codec;
pub mod crc;
pub mod frame;

pub use self::codec::{Assembled, CodecStats, FrameCodec};
pub use self::frame::{Cause, ControlType, Diagnostic, Frame, Header};
