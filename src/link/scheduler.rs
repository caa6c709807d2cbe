//! Output scheduler and transmit staging
//!
//! Each call to [`LinkEngine::poll_output`] runs one cycle:
//!
//! 1. channel 0's control queue, dropping an RR when a sequenced frame
//!    queued behind it will carry the same acknowledgment
//! 2. a flagged retransmission of channel 0's oldest unacknowledged frame
//! 3. control frames on channels 1-15, one per channel per round
//! 4. data frames on channels 1-15, one per channel per round
//!
//! Everything stops as soon as the staging slots are full; the round-robin
//! cursors stay where they were so the next cycle resumes in place.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::core::{ChannelId, Error, Result, Seq, MAX_CHANNELS};
use crate::protocol::frame::{seq_byte, OFFSET_HEADER_CRC, OFFSET_SEQ};
use crate::protocol::{Cause, ControlType, Diagnostic};
use crate::timer::{Granularity, TimerAction, TimerClass};
use super::channel::{LocalFlow, Packet, RemoteFlow, ResetState};
use super::LinkEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Staged,
    InFlight,
}

#[derive(Debug)]
struct TxSlot {
    state: SlotState,
    channel: ChannelId,
    frame: Bytes,
    /// Chain released on completion; sequenced frames stay unacknowledged instead
    held: Option<Packet>,
    order: u64,
}

/// Fixed set of transmit slots shared with the transport
#[derive(Debug)]
pub struct TxSlots {
    slots: Vec<TxSlot>,
    next_order: u64,
}

impl TxSlots {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|_| TxSlot {
                state: SlotState::Free,
                channel: ChannelId::CONTROL,
                frame: Bytes::new(),
                held: None,
                order: 0,
            })
            .collect();
        TxSlots { slots, next_order: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn has_free(&self) -> bool {
        self.slots.iter().any(|s| s.state == SlotState::Free)
    }

    /// Slots that are staged or on the wire
    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.state != SlotState::Free).count()
    }

    fn stage(&mut self, channel: ChannelId, frame: Bytes, held: Option<Packet>) -> std::result::Result<usize, Option<Packet>> {
        let Some(index) = self.slots.iter().position(|s| s.state == SlotState::Free) else {
            return Err(held);
        };
        let order = self.next_order;
        self.next_order += 1;
        self.slots[index] = TxSlot {
            state: SlotState::Staged,
            channel,
            frame,
            held,
            order,
        };
        Ok(index)
    }

    /// Hands the oldest staged frame to the transport
    fn take_ready(&mut self) -> Option<(usize, Bytes)> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Staged)
            .min_by_key(|(_, s)| s.order)?;
        slot.state = SlotState::InFlight;
        Some((index, slot.frame.clone()))
    }

    fn complete(&mut self, index: usize) -> Result<Option<Packet>> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::invalid_state(format!("no transmit slot {}", index)))?;
        if slot.state != SlotState::InFlight {
            return Err(Error::invalid_state(format!("transmit slot {} is not in flight", index)));
        }
        slot.state = SlotState::Free;
        slot.frame = Bytes::new();
        Ok(slot.held.take())
    }

    /// Drops staged frames not yet taken by the transport, for one channel or all
    pub(crate) fn discard_staged(&mut self, channel: Option<ChannelId>, pool: &mut BufferPool) {
        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Staged || channel.is_some_and(|c| c != slot.channel) {
                continue;
            }
            slot.state = SlotState::Free;
            slot.frame = Bytes::new();
            if let Some(packet) = slot.held.take() {
                pool.free(packet.chain);
            }
        }
    }
}

/// Writes N(S)/N(R) into a built frame and recomputes its header CRC
fn stamp(pool: &mut BufferPool, packet: &mut Packet, ns: Seq, nr: Seq) -> Result<()> {
    packet.header.ns = ns;
    packet.header.nr = nr;
    pool.set_byte(&packet.chain, OFFSET_SEQ, seq_byte(ns, nr))?;
    let [high, low] = packet.header.crc().to_be_bytes();
    pool.set_byte(&packet.chain, OFFSET_HEADER_CRC, high)?;
    pool.set_byte(&packet.chain, OFFSET_HEADER_CRC + 1, low)?;
    Ok(())
}

impl LinkEngine {
    /// Runs one output cycle, returning the number of frames staged
    pub fn poll_output(&mut self) -> Result<usize> {
        let mut staged = 0;
        let control = ChannelId::CONTROL;

        // 1. channel 0 control queue
        while self.slots.has_free() {
            let Some(packet) = self.next_control(control) else {
                break;
            };
            self.transmit(packet)?;
            staged += 1;
        }

        // 2. channel 0 retransmission
        if self.slots.has_free() && self.retransmit_due(control) {
            staged += self.retransmit_oldest(control)?;
        }

        // 3. session control, round-robin
        staged += self.round_robin(false)?;

        // 4. session data, round-robin
        staged += self.round_robin(true)?;

        if staged > 0 {
            trace!(staged, busy = self.slots.busy(), "output cycle");
        }
        Ok(staged)
    }

    /// Takes the next staged frame for the transport
    pub fn take_transmit(&mut self) -> Option<(usize, Bytes)> {
        self.slots.take_ready()
    }

    /// Releases a slot once the transport has sent its frame
    pub fn transmit_complete(&mut self, slot: usize) -> Result<()> {
        if let Some(packet) = self.slots.complete(slot)? {
            self.pool.free(packet.chain);
        }
        Ok(())
    }

    fn round_robin(&mut self, data: bool) -> Result<usize> {
        let mut staged = 0;
        let mut idle = 0;
        while idle < ChannelId::sessions().count() {
            if !self.slots.has_free() {
                break;
            }
            let cursor = if data { &mut self.data_cursor } else { &mut self.ctrl_cursor };
            let channel = ChannelId::from_nibble(*cursor);
            *cursor = if *cursor as usize >= MAX_CHANNELS - 1 { 1 } else { *cursor + 1 };

            let sent = if data {
                self.stage_data(channel)?
            } else {
                match self.next_control(channel) {
                    Some(packet) => {
                        self.transmit(packet)?;
                        1
                    }
                    None => 0,
                }
            };
            if sent > 0 {
                staged += sent;
                idle = 0;
            } else {
                idle += 1;
            }
        }
        Ok(staged)
    }

    /// Whether a channel could stage a new sequenced frame right now
    fn can_send_sequenced(&self, channel: ChannelId) -> bool {
        let ch = &self.channels[channel.index()];
        let flowing = channel.is_control() || ch.reset_state() == Some(ResetState::FlowReady);
        self.is_ready() && flowing && ch.remote == RemoteFlow::Ready && ch.send_credit > 0
    }

    /// Pops the next eligible frame from a channel's control queue
    ///
    /// Sequenced control frames (DIAG) wait for credit without blocking the
    /// frames queued behind them.
    fn next_control(&mut self, channel: ChannelId) -> Option<Packet> {
        let sequenced_ok = self.can_send_sequenced(channel);
        loop {
            let ch = &mut self.channels[channel.index()];
            let id = ch
                .link_out
                .iter()
                .find(|p| !p.header.is_sequenced() || sequenced_ok)
                .map(|p| p.chain.id())?;
            let packet = ch.link_out.remove(id)?;

            if packet.header.control_type() == Some(ControlType::Rr) && self.rr_redundant(channel) {
                trace!(%channel, "RR superseded by piggy-backed acknowledgment");
                self.pool.free(packet.chain);
                continue;
            }
            return Some(packet);
        }
    }

    /// An RR adds nothing when a sequenced frame on the same channel is about to carry N(R)
    fn rr_redundant(&self, channel: ChannelId) -> bool {
        let ch = &self.channels[channel.index()];
        if ch.local == LocalFlow::Transitioning || !self.can_send_sequenced(channel) {
            return false;
        }
        if channel.is_control() {
            ch.link_out.iter().any(|p| p.header.is_sequenced())
        } else {
            !ch.pending_out.is_empty()
        }
    }

    /// A flagged retransmission goes out once the peer can take it
    fn retransmit_due(&self, channel: ChannelId) -> bool {
        let ch = &self.channels[channel.index()];
        ch.retransmit && self.is_ready() && ch.remote == RemoteFlow::Ready
    }

    /// Stages a flagged retransmission or the next new data frame
    fn stage_data(&mut self, channel: ChannelId) -> Result<usize> {
        let ch = &self.channels[channel.index()];
        if ch.retransmit && !ch.unacked.is_empty() {
            if self.retransmit_due(channel) {
                return self.retransmit_oldest(channel);
            }
            return Ok(0);
        }
        if !self.can_send_sequenced(channel) {
            return Ok(0);
        }
        match self.channels[channel.index()].pending_out.pop_front() {
            Some(packet) => {
                self.transmit(packet)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Stamps a frame, copies it into a slot and files the chain
    fn transmit(&mut self, mut packet: Packet) -> Result<()> {
        let channel = packet.header.channel;
        let sequenced = packet.header.is_sequenced();
        let ctype = packet.header.control_type();
        let carries_ack = sequenced || ctype.is_some_and(ControlType::is_flow);

        let ch = &mut self.channels[channel.index()];
        let ns = if sequenced { ch.send_seq } else { Seq::default() };
        let nr = ch.next_expected();
        stamp(&mut self.pool, &mut packet, ns, nr)?;
        let frame = self.pool.to_bytes(&packet.chain);

        if carries_ack {
            ch.rotate_receive_window();
        }
        if ctype == Some(ControlType::Rr) && ch.local == LocalFlow::Transitioning {
            debug!(%channel, "receiver ready announced");
            ch.local = LocalFlow::Ready;
        }

        let held = if sequenced {
            ch.send_seq = ch.send_seq.next();
            ch.send_credit = ch.send_credit.saturating_sub(1);
            ch.unacked.push_back(packet);
            if ch.unacked.len() == 1 {
                self.start_rotation(channel);
            }
            None
        } else {
            Some(packet)
        };

        trace!(%channel, %ns, %nr, ?ctype, len = frame.len(), "staged");
        self.stats.frames_out += 1;
        if let Err(held) = self.slots.stage(channel, frame, held) {
            // Callers check for a free slot first
            if let Some(packet) = held {
                self.pool.free(packet.chain);
            }
            return Err(Error::invalid_state("no free transmit slot"));
        }
        Ok(())
    }

    /// Sends the oldest unacknowledged frame again with a fresh N(R)
    fn retransmit_oldest(&mut self, channel: ChannelId) -> Result<usize> {
        let ch = &mut self.channels[channel.index()];
        ch.retransmit = false;
        let nr = ch.next_expected();
        let Some(packet) = ch.unacked.front_mut() else {
            return Ok(0);
        };
        let ns = packet.header.ns;
        stamp(&mut self.pool, packet, ns, nr)?;
        let frame = self.pool.to_bytes(&packet.chain);
        ch.rotate_receive_window();

        debug!(%channel, %ns, "retransmitting");
        self.stats.retransmissions += 1;
        self.stats.frames_out += 1;
        self.start_rotation(channel);
        self.slots
            .stage(channel, frame, None)
            .map_err(|_| Error::invalid_state("no free transmit slot"))?;
        Ok(1)
    }

    fn start_rotation(&mut self, channel: ChannelId) {
        self.timers.start(
            Granularity::Medium,
            TimerClass::Rotation,
            channel,
            self.config.rotation_ticks,
            TimerAction::FlagRetransmit,
        );
    }

    /// Rotation timeout: flag a retransmission for the next output cycle
    pub(crate) fn on_rotation_timer(&mut self, channel: ChannelId) {
        let limit = self.config.retransmit_retries;
        let ch = &mut self.channels[channel.index()];
        if ch.unacked.is_empty() {
            return;
        }
        let retries = &mut ch.retries[TimerClass::Rotation.index()];
        *retries += 1;
        if *retries > limit {
            warn!(%channel, retries = *retries, "no acknowledgment, giving up on window");
            let cause = Cause::LocalProcedureError;
            if channel.is_control() {
                self.initiate_restart(cause, Diagnostic::RetransmitExhausted);
            } else {
                self.initiate_reset(channel, cause, Diagnostic::RetransmitExhausted);
            }
            return;
        }
        debug!(%channel, attempt = *retries, "window rotation timed out");
        ch.retransmit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkConfig;
    use crate::link::tests::{ch, data_frame, ready_engine, transmitted};
    use crate::protocol::{Assembled, Frame};

    #[test]
    fn test_slots_stage_in_order_and_reject_when_full() {
        let mut slots = TxSlots::new(2);
        assert_eq!(slots.stage(ch(1), Bytes::from_static(b"a"), None).ok(), Some(0));
        assert_eq!(slots.stage(ch(2), Bytes::from_static(b"b"), None).ok(), Some(1));
        assert!(!slots.has_free());
        assert!(slots.stage(ch(3), Bytes::from_static(b"c"), None).is_err());

        assert_eq!(slots.take_ready(), Some((0, Bytes::from_static(b"a"))));
        assert!(slots.complete(1).is_err());
        assert!(slots.complete(0).unwrap().is_none());
        assert!(slots.complete(0).is_err());
        assert_eq!(slots.stage(ch(3), Bytes::from_static(b"c"), None).ok(), Some(0));

        // Older staged frame still goes first
        assert_eq!(slots.take_ready().map(|(i, _)| i), Some(1));
        assert_eq!(slots.take_ready().map(|(i, _)| i), Some(0));
        assert!(slots.take_ready().is_none());
    }

    #[test]
    fn test_stamp_rewrites_sequence_and_crc() {
        let mut pool = BufferPool::new(8, 16).unwrap();
        let frame = Frame::data(ch(1), false, 0, b"abc").unwrap();
        let chain = pool.alloc_with(&frame.to_bytes()).unwrap();
        let mut packet = Packet { header: frame.header, chain };

        stamp(&mut pool, &mut packet, Seq::new(5), Seq::new(9)).unwrap();
        let mut expected = frame.clone();
        expected.header.ns = Seq::new(5);
        expected.header.nr = Seq::new(9);
        assert_eq!(pool.to_bytes(&packet.chain), expected.to_bytes());
        pool.free(packet.chain);
    }

    #[test]
    fn test_full_slots_hold_output_until_completion() {
        let config = LinkConfig { window_size: 7, tx_slots: 2, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        for n in 0..4u8 {
            engine.submit(ch(1), false, 0, &[n]).unwrap();
        }
        assert_eq!(engine.poll_output().unwrap(), 2);
        assert_eq!(engine.poll_output().unwrap(), 0);
        assert_eq!(engine.channel(ch(1)).pending_len(), 2);

        let (slot, _) = engine.take_transmit().unwrap();
        engine.transmit_complete(slot).unwrap();
        assert_eq!(engine.poll_output().unwrap(), 1);
        // The freed slot was reused and is staged, not yet in flight
        assert!(engine.transmit_complete(slot).is_err());
    }

    #[test]
    fn test_round_robin_interleaves_channels() {
        let config = LinkConfig { window_size: 3, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        for _ in 0..2 {
            engine.submit(ch(1), false, 0, b"one").unwrap();
            engine.submit(ch(2), false, 0, b"two").unwrap();
        }
        let sent = transmitted(&mut engine);
        let order: Vec<u8> = sent.iter().map(|f| f.header.channel.number()).collect();
        assert_eq!(order, vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_round_robin_resumes_after_full_slots() {
        let config = LinkConfig { window_size: 3, tx_slots: 1, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        for n in [1, 2, 3] {
            engine.submit(ch(n), false, 0, b"x").unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            assert_eq!(engine.poll_output().unwrap(), 1);
            let (slot, bytes) = engine.take_transmit().unwrap();
            order.push(bytes[2] & 0x0F);
            engine.transmit_complete(slot).unwrap();
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_control_goes_before_data() {
        let mut engine = ready_engine(LinkConfig::default());
        engine.submit(ch(1), false, 0, b"data").unwrap();
        engine.reset_channel(ch(2), crate::protocol::Cause::DteOriginated).unwrap();
        let sent = transmitted(&mut engine);
        assert_eq!(sent[0].control_type(), Some(ControlType::Reset));
        assert_eq!(sent[1].header.channel, ch(1));
    }

    #[test]
    fn test_rr_suppressed_when_data_carries_ack() {
        let mut engine = ready_engine(LinkConfig::default());
        engine.receive(Assembled::Frame(data_frame(ch(1), 0, b"in")));
        engine.submit(ch(1), false, 0, b"out").unwrap();

        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].header.control);
        assert_eq!(sent[0].header.nr, Seq::new(1));
        assert_eq!(engine.channel(ch(1)).receive_window(), (Seq::new(1), Seq::new(2)));
    }

    #[test]
    fn test_rotation_timeout_retransmits_oldest() {
        let config = LinkConfig { rotation_ticks: 2, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        engine.submit(ch(1), false, 0, b"first").unwrap();
        engine.submit(ch(1), false, 0, b"second").unwrap();
        assert_eq!(transmitted(&mut engine).len(), 2);
        assert!(engine.timers.is_active(TimerClass::Rotation, ch(1)));

        engine.tick(Granularity::Medium);
        engine.tick(Granularity::Medium);
        assert!(engine.channel(ch(1)).retransmit);

        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..], b"first");
        assert_eq!(sent[0].header.ns, Seq::new(0));
        assert_eq!(engine.stats().retransmissions, 1);
        assert_eq!(engine.channel(ch(1)).unacked_len(), 2);
        assert!(engine.timers.is_active(TimerClass::Rotation, ch(1)));
    }

    #[test]
    fn test_retransmit_exhaustion_resets_channel() {
        let config = LinkConfig { rotation_ticks: 1, retransmit_retries: 2, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        engine.submit(ch(7), false, 0, b"void").unwrap();
        transmitted(&mut engine);

        for _ in 0..2 {
            engine.tick(Granularity::Medium);
            assert_eq!(transmitted(&mut engine).len(), 1);
        }
        engine.tick(Granularity::Medium);
        assert_eq!(engine.channel(ch(7)).reset_state(), Some(ResetState::ResetPending));
        let sent = transmitted(&mut engine);
        assert_eq!(sent[0].control_type(), Some(ControlType::Reset));
        assert_eq!(sent[0].data[1], Diagnostic::RetransmitExhausted.code());
    }

    #[test]
    fn test_diag_waits_for_credit_without_blocking_rr() {
        let config = LinkConfig { window_size: 1, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        engine.send_diag(Diagnostic::InvalidFlags);
        engine.send_diag(Diagnostic::WrongChannel);
        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(engine.channel(ChannelId::CONTROL).control_len(), 1);

        engine.on_keepalive();
        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].control_type(), Some(ControlType::Rr));
    }
}
