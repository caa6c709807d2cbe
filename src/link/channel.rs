use crate::buffer::{BufferPool, Chain, ChainQueue, Chained};
use crate::core::{ChannelId, Seq};
use crate::protocol::Header;
use crate::timer::TimerClass;

/// A frame held in a buffer chain together with its decoded header
#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    pub chain: Chain,
}

impl Chained for Packet {
    fn chain(&self) -> &Chain {
        &self.chain
    }

    fn into_chain(self) -> Chain {
        self.chain
    }
}

/// Peer's ability to receive on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFlow {
    Ready,
    NotReady,
}

/// This side's ability to receive on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFlow {
    Ready,
    NotReady,
    /// Recovered; waiting for the RR that tells the peer
    Transitioning,
}

/// Device restart handshake state, kept on channel 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    WaitingForRestart,
    PacketReady,
    RestartPending,
}

/// Per-channel reset handshake state, channels 1-15
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    FlowReady,
    ResetPending,
    /// Reset retries exhausted or peer lost; needs a new reset to revive
    Cleared,
}

/// Which handshake a channel takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Restart(RestartState),
    Reset(ResetState),
}

/// Flow-control frames that could not be allocated and are still owed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owed {
    pub rr: bool,
    pub rnr: bool,
    pub reject: bool,
}

impl Owed {
    pub fn any(&self) -> bool {
        self.rr || self.rnr || self.reject
    }
}

/// Protocol state of one logical channel
#[derive(Debug)]
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) phase: Phase,
    pub(crate) window: u8,
    /// V(S): N(S) for the next new sequenced frame
    pub(crate) send_seq: Seq,
    /// Oldest unacknowledged N(S), i.e. the last N(R) received
    pub(crate) ack_seq: Seq,
    /// Sequenced frames that may still be sent before an acknowledgment
    pub(crate) send_credit: u8,
    /// Last N(S) accepted from the peer
    pub(crate) last_recv: Seq,
    pub(crate) recv_low: Seq,
    pub(crate) recv_high: Seq,
    /// Data frames still permitted in the current receive window
    pub(crate) recv_budget: u8,
    pub(crate) remote: RemoteFlow,
    pub(crate) local: LocalFlow,
    pub(crate) retries: [u8; TimerClass::COUNT],
    /// Retransmit the oldest unacknowledged frame on the next cycle
    pub(crate) retransmit: bool,
    /// A REJECT is outstanding; suppress further ones until in-sequence data arrives
    pub(crate) reject_sent: bool,
    pub(crate) owed: Owed,
    /// Cause and diagnostic of the last RESET/RESTART we sent
    pub(crate) last_cause: [u8; 2],
    /// Session frames waiting for the link
    pub(crate) pending_out: ChainQueue<Packet>,
    /// Control frames toward the peer
    pub(crate) link_out: ChainQueue<Packet>,
    /// Frames delivered to the session layer
    pub(crate) inbound: ChainQueue<Packet>,
    /// Sent sequenced frames awaiting acknowledgment
    pub(crate) unacked: ChainQueue<Packet>,
}

impl Channel {
    pub fn new(id: ChannelId, window: u8) -> Self {
        let phase = if id.is_control() {
            Phase::Restart(RestartState::WaitingForRestart)
        } else {
            Phase::Reset(ResetState::FlowReady)
        };
        let mut channel = Channel {
            id,
            phase,
            window,
            send_seq: Seq::default(),
            ack_seq: Seq::default(),
            send_credit: window,
            last_recv: Seq::default(),
            recv_low: Seq::default(),
            recv_high: Seq::default(),
            recv_budget: window,
            remote: RemoteFlow::Ready,
            local: LocalFlow::Ready,
            retries: [0; TimerClass::COUNT],
            retransmit: false,
            reject_sent: false,
            owed: Owed::default(),
            last_cause: [0; 2],
            pending_out: ChainQueue::new(),
            link_out: ChainQueue::new(),
            inbound: ChainQueue::new(),
            unacked: ChainQueue::new(),
        };
        channel.reset_window();
        channel
    }

    /// Returns sequence numbers, window and flow state to their initial values
    pub(crate) fn reset_window(&mut self) {
        self.send_seq = Seq::default();
        self.ack_seq = Seq::default();
        self.send_credit = self.window;
        self.last_recv = Seq::default().prev();
        self.rotate_receive_window();
        self.remote = RemoteFlow::Ready;
        self.local = LocalFlow::Ready;
        self.retries = [0; TimerClass::COUNT];
        self.retransmit = false;
        self.reject_sent = false;
        self.owed = Owed::default();
    }

    /// Frees everything queued toward the peer; delivered frames stay
    pub(crate) fn clear_outbound(&mut self, pool: &mut BufferPool) {
        self.pending_out.clear(pool);
        self.link_out.clear(pool);
        self.unacked.clear(pool);
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_state(&self) -> Option<RestartState> {
        match self.phase {
            Phase::Restart(state) => Some(state),
            Phase::Reset(_) => None,
        }
    }

    pub fn reset_state(&self) -> Option<ResetState> {
        match self.phase {
            Phase::Reset(state) => Some(state),
            Phase::Restart(_) => None,
        }
    }

    pub fn send_seq(&self) -> Seq {
        self.send_seq
    }

    pub fn ack_seq(&self) -> Seq {
        self.ack_seq
    }

    pub fn last_received(&self) -> Seq {
        self.last_recv
    }

    /// N(R) to advertise: the next N(S) expected from the peer
    pub fn next_expected(&self) -> Seq {
        self.last_recv.next()
    }

    pub fn receive_window(&self) -> (Seq, Seq) {
        (self.recv_low, self.recv_high)
    }

    pub fn remote_flow(&self) -> RemoteFlow {
        self.remote
    }

    pub fn local_flow(&self) -> LocalFlow {
        self.local
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_out.len()
    }

    pub fn control_len(&self) -> usize {
        self.link_out.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Buflets held by this channel's queues
    pub fn held_buflets(&self) -> usize {
        self.pending_out.buflets()
            + self.link_out.buflets()
            + self.inbound.buflets()
            + self.unacked.buflets()
    }
}
