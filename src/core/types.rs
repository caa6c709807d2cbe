use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::error::{Error, Result};

/// Logical channel number on the link (0 is the restart/control channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(u8);

impl ChannelId {
    /// The device-wide control channel
    pub const CONTROL: ChannelId = ChannelId(0);

    /// Creates a channel id, rejecting numbers outside the 4-bit field
    pub fn new(number: u8) -> Option<Self> {
        if (number as usize) < super::MAX_CHANNELS {
            Some(ChannelId(number))
        } else {
            None
        }
    }

    /// Builds a channel id from the low nibble of a header byte
    pub fn from_nibble(bits: u8) -> Self {
        ChannelId(bits & 0x0F)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is channel 0
    pub fn is_control(self) -> bool {
        self.0 == 0
    }

    /// Every channel, control channel first
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..super::MAX_CHANNELS as u8).map(ChannelId)
    }

    /// Session channels 1..=15
    pub fn sessions() -> impl Iterator<Item = ChannelId> {
        (1..super::MAX_CHANNELS as u8).map(ChannelId)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number modulo 16
///
/// All comparisons are circular; there are no absolute counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Seq(u8);

impl Seq {
    pub const MODULUS: u8 = 16;

    pub fn new(value: u8) -> Self {
        Seq(value % Self::MODULUS)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        self.add(1)
    }

    pub fn prev(self) -> Self {
        Seq((self.0 + Self::MODULUS - 1) % Self::MODULUS)
    }

    pub fn add(self, n: u8) -> Self {
        Seq(((self.0 as u16 + n as u16) % Self::MODULUS as u16) as u8)
    }

    /// Number of forward steps from `self` to `other`
    pub fn distance_to(self, other: Seq) -> u8 {
        (other.0 + Self::MODULUS - self.0) % Self::MODULUS
    }

    /// Inclusive circular range check, `low..=high`
    pub fn in_range(self, low: Seq, high: Seq) -> bool {
        if low.0 <= high.0 {
            low.0 <= self.0 && self.0 <= high.0
        } else {
            self.0 >= low.0 || self.0 <= high.0
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the link this engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Terminal side; initiates the restart handshake at start-up
    Dte,
    /// Network side; waits for the peer's restart
    Dce,
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    /// Line speed
    pub baud_rate: u32,
}

/// Configuration for the link engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Which side initiates the restart handshake
    pub role: Role,
    /// Send and receive window size
    pub window_size: u8,
    /// Number of buflets in the pool
    pub pool_size: usize,
    /// Capacity of one buflet in bytes
    pub buflet_size: usize,
    /// Free count at or below which inbound data is refused outright
    pub critical_low_water: usize,
    /// Base free count below which a channel goes not-ready
    pub low_water: usize,
    /// Extra free buflets required per open session channel
    pub per_channel_reserve: usize,
    /// Buflets above the threshold needed before a channel is ready again
    pub flow_hysteresis: usize,
    /// Number of transmit staging slots
    pub tx_slots: usize,
    /// RESTART resends before the peer is declared lost
    pub restart_retries: u8,
    /// RESET resends before the channel is cleared
    pub reset_retries: u8,
    /// Rotation timeouts without progress before the channel is reset
    pub retransmit_retries: u8,
    /// Restart retry timer length (coarse ticks)
    pub restart_ticks: u32,
    /// Reset retry timer length (coarse ticks)
    pub reset_ticks: u32,
    /// Keepalive period on channel 0 (coarse ticks)
    pub keepalive_ticks: u32,
    /// Window-rotation timer length (medium ticks)
    pub rotation_ticks: u32,
    /// Deferred control frame retry (fine ticks)
    pub defer_ticks: u32,
    /// Coarse tick period
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub coarse_tick: Duration,
    /// Medium tick period
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub medium_tick: Duration,
    /// Fine tick period
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub fine_tick: Duration,
    /// Serial line to open, if any
    pub serial: Option<SerialConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            role: Role::Dte,
            window_size: 2,
            pool_size: 256,
            buflet_size: 16,
            critical_low_water: 8,
            low_water: 24,
            per_channel_reserve: 2,
            flow_hysteresis: 8,
            tx_slots: 4,
            restart_retries: 5,
            reset_retries: 5,
            retransmit_retries: 8,
            restart_ticks: 3,
            reset_ticks: 3,
            keepalive_ticks: 10,
            rotation_ticks: 10,
            defer_ticks: 2,
            coarse_tick: Duration::from_secs(1),
            medium_tick: Duration::from_millis(200),
            fine_tick: Duration::from_millis(50),
            serial: None,
        }
    }
}

impl LinkConfig {
    /// Parses a JSON configuration document; missing fields take defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Checks that every value is usable by the engine
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.window_size >= Seq::MODULUS {
            return Err(Error::config(format!(
                "window_size must be 1..={}, got {}",
                Seq::MODULUS - 1,
                self.window_size
            )));
        }
        if self.buflet_size == 0 {
            return Err(Error::config("buflet_size must be non-zero"));
        }
        if self.pool_size == 0 || self.pool_size > u16::MAX as usize {
            return Err(Error::config(format!("pool_size out of range: {}", self.pool_size)));
        }
        if self.critical_low_water >= self.pool_size {
            return Err(Error::config("critical_low_water must be below pool_size"));
        }
        if self.low_water < self.critical_low_water {
            return Err(Error::config("low_water must not be below critical_low_water"));
        }
        if self.tx_slots == 0 {
            return Err(Error::config("tx_slots must be non-zero"));
        }
        let ticks = [
            ("restart_ticks", self.restart_ticks),
            ("reset_ticks", self.reset_ticks),
            ("keepalive_ticks", self.keepalive_ticks),
            ("rotation_ticks", self.rotation_ticks),
            ("defer_ticks", self.defer_ticks),
        ];
        for (name, value) in ticks {
            if value == 0 {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        let periods = [
            ("coarse_tick", self.coarse_tick),
            ("medium_tick", self.medium_tick),
            ("fine_tick", self.fine_tick),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Buflets needed to hold `len` bytes
    pub fn buflets_for(&self, len: usize) -> usize {
        len.div_ceil(self.buflet_size).max(1)
    }
}
