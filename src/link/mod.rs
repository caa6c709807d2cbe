//! Link protocol engine
//!
//! [`LinkEngine`] owns every piece of protocol state: the buffer pool, the
//! sixteen channels with their queues and windows, the timer table and the
//! transmit staging slots. It is plain synchronous code with a single
//! writer; the transport layer feeds it bytes, ticks and transmit
//! completions and collects staged frames from it.
//!
//! Per-frame protocol errors never come back as `Err`. They are answered on
//! the wire (REJECT, RESET, RESTART or DIAG) at the point of detection, and
//! conditions the session layer must know about are queued as
//! [`LinkEvent`]s.

pub mod channel;
pub mod flow;
pub mod receive;
pub mod restart;
pub mod scheduler;
pub mod window;

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::core::{ChannelId, Error, LinkConfig, Result, Role, MAX_CHANNELS, MAX_EXTRA_DATA};
use crate::protocol::frame::MAX_FRAME_LEN;
use crate::protocol::{Assembled, Cause, CodecStats, Diagnostic, Frame, FrameCodec};
use crate::timer::{Expired, Granularity, TimerAction, TimerTable};

pub use self::channel::{Channel, LocalFlow, Packet, Phase, RemoteFlow, ResetState, RestartState};
pub use self::scheduler::TxSlots;
pub use self::window::SeqCheck;

/// Something the session layer should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The restart handshake completed; every channel starts afresh
    Restarted { cause: Cause },
    /// A channel finished a reset handshake
    ChannelReset { channel: ChannelId, cause: Cause },
    /// Retries exhausted; channel 0 means the whole link
    PeerLost { channel: ChannelId },
    /// The peer reported a diagnostic
    Diagnostic { code: Diagnostic },
    /// A frame is waiting in the channel's inbound queue
    FrameDelivered { channel: ChannelId },
}

/// A frame handed up to the session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub channel: ChannelId,
    /// Signalling rather than user data
    pub qualifier: bool,
    /// Session packet type
    pub function: u8,
    pub data: Bytes,
}

/// Line counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub retransmissions: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub diagnostics_sent: u64,
    pub rnr_sent: u64,
    pub duplicates: u64,
    /// Data frames refused because the pool was exhausted
    pub dropped_low_resource: u64,
    pub codec: CodecStats,
}

/// Point-to-point link protocol engine
pub struct LinkEngine {
    config: LinkConfig,
    pool: BufferPool,
    channels: Vec<Channel>,
    timers: TimerTable,
    codec: FrameCodec,
    rx_buf: BytesMut,
    slots: TxSlots,
    /// Next session channel for control round-robin
    ctrl_cursor: u8,
    /// Next session channel for data round-robin
    data_cursor: u8,
    events: VecDeque<LinkEvent>,
    stats: LinkStats,
    fired: Vec<Expired>,
}

impl LinkEngine {
    /// Creates an engine with every channel idle and channel 0 waiting for restart
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(config.pool_size, config.buflet_size)?;
        let channels = ChannelId::all()
            .map(|id| Channel::new(id, config.window_size))
            .collect();

        Ok(LinkEngine {
            slots: TxSlots::new(config.tx_slots),
            config,
            pool,
            channels,
            timers: TimerTable::new(),
            codec: FrameCodec::new(),
            rx_buf: BytesMut::with_capacity(MAX_FRAME_LEN * 2),
            ctrl_cursor: 1,
            data_cursor: 1,
            events: VecDeque::new(),
            stats: LinkStats::default(),
            fired: Vec::with_capacity(MAX_CHANNELS),
        })
    }

    /// Brings the link up; a DTE initiates the restart handshake
    pub fn start(&mut self) {
        match self.config.role {
            Role::Dte => self.initiate_restart(Cause::DteOriginated, Diagnostic::NoInformation),
            Role::Dce => debug!("waiting for peer restart"),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub fn restart_state(&self) -> RestartState {
        self.channels[ChannelId::CONTROL.index()]
            .restart_state()
            .unwrap_or(RestartState::WaitingForRestart)
    }

    pub fn is_ready(&self) -> bool {
        self.restart_state() == RestartState::PacketReady
    }

    /// Buflets currently free in the pool
    pub fn free_buffers(&self) -> usize {
        self.pool.free_count()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            codec: self.codec.stats(),
            ..self.stats
        }
    }

    /// Queues a session frame for transmission
    ///
    /// Returns [`Error::NotReady`] while the link or channel is not
    /// accepting data or the pool is too low to take the frame.
    pub fn submit(&mut self, channel: ChannelId, qualifier: bool, function: u8, data: &[u8]) -> Result<()> {
        if channel.is_control() {
            return Err(Error::invalid_state("channel 0 carries no session data"));
        }
        if data.len() > MAX_EXTRA_DATA {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds {}",
                data.len(),
                MAX_EXTRA_DATA
            )));
        }
        if !self.is_ready() {
            return Err(Error::not_ready("link restart in progress"));
        }
        match self.channels[channel.index()].reset_state() {
            Some(ResetState::FlowReady) => {}
            Some(ResetState::Cleared) => return Err(Error::PeerLost { channel }),
            _ => return Err(Error::not_ready(format!("channel {} is resetting", channel))),
        }

        let frame = Frame::data(channel, qualifier, function, data)?;
        let bytes = frame.to_bytes();
        let needed = self.pool.buflets_for(bytes.len());
        if self.pool.free_count() < needed + self.config.critical_low_water {
            return Err(Error::not_ready("buffer pool low"));
        }
        let chain = self
            .pool
            .alloc_with(&bytes)
            .ok_or_else(|| Error::not_ready("buffer pool exhausted"))?;

        self.channels[channel.index()]
            .pending_out
            .push_back(Packet { header: frame.header, chain });
        debug!(%channel, len = data.len(), qualifier, "queued for transmission");
        Ok(())
    }

    /// Takes the next frame delivered on a channel
    pub fn deliver(&mut self, channel: ChannelId) -> Option<Delivered> {
        let packet = self.channels[channel.index()].inbound.pop_front()?;
        let data = self.pool.to_bytes(&packet.chain);
        self.pool.free(packet.chain);
        Some(Delivered {
            channel,
            qualifier: packet.header.qualifier,
            function: packet.header.function,
            data,
        })
    }

    /// Resets a session channel at the session layer's request
    pub fn reset_channel(&mut self, channel: ChannelId, cause: Cause) -> Result<()> {
        if channel.is_control() {
            return Err(Error::invalid_state("channel 0 is restarted, not reset"));
        }
        if !self.is_ready() {
            return Err(Error::not_ready("link restart in progress"));
        }
        self.initiate_reset(channel, cause, Diagnostic::NoInformation);
        Ok(())
    }

    /// Restarts the whole link at the session layer's request
    pub fn restart(&mut self, cause: Cause) {
        self.initiate_restart(cause, Diagnostic::NoInformation);
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Feeds raw line bytes through the frame assembler
    ///
    /// Returns the number of frames assembled.
    pub fn receive_bytes(&mut self, bytes: &[u8]) -> usize {
        self.rx_buf.extend_from_slice(bytes);
        let mut count = 0;
        loop {
            match self.codec.decode(&mut self.rx_buf) {
                Ok(Some(item)) => {
                    self.receive(item);
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("frame assembler failed: {}", e);
                    self.rx_buf.clear();
                    break;
                }
            }
        }
        count
    }

    /// Advances one tick source and runs the expired timers' actions
    pub fn tick(&mut self, granularity: Granularity) {
        let mut fired = std::mem::take(&mut self.fired);
        self.timers.tick(granularity, &mut fired);

        for expired in fired.drain(..) {
            let channel = expired.id.channel;
            match expired.action {
                TimerAction::ResendRestart => self.on_restart_timer(),
                TimerAction::ResendReset => self.on_reset_timer(channel),
                TimerAction::FlagRetransmit => self.on_rotation_timer(channel),
                TimerAction::SendKeepalive => self.on_keepalive(),
                TimerAction::RetryDeferred => self.retry_deferred(channel),
            }
        }
        self.fired = fired;
    }

    fn emit(&mut self, event: LinkEvent) {
        debug!(?event, "link event");
        self.events.push_back(event);
    }
}
