use std::io;
use thiserror::Error;

use super::types::ChannelId;

/// Custom error types for the packet link
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Back-pressure: the pool or the transmit staging area is exhausted
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Peer lost on channel {channel}")]
    PeerLost { channel: ChannelId },

    #[error("Link driver has shut down")]
    ChannelClosed,
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new buffer error
    pub fn buffer(msg: impl Into<String>) -> Self {
        Error::Buffer(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new back-pressure error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Error::NotReady(msg.into())
    }

    /// Whether the caller may simply try again later
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}
