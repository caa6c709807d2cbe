//! Flow control
//!
//! RR, RNR and REJECT from the peer drive the remote flag and go-back-N;
//! buffer pool pressure drives the local flag. A channel that went
//! not-ready locally only becomes ready again through a fresh RR, sent from
//! [`LinkEngine::poll_flow`] once enough buflets are free.

use tracing::{debug, trace, warn};

use crate::core::{ChannelId, Seq};
use crate::protocol::{Cause, ControlType, Diagnostic};
use crate::timer::{Granularity, TimerAction, TimerClass};
use super::channel::{LocalFlow, Phase, RemoteFlow, ResetState};
use super::LinkEngine;

impl LinkEngine {
    pub(crate) fn on_rr(&mut self, channel: ChannelId, nr: Seq) {
        trace!(%channel, %nr, "RR");
        self.channels[channel.index()].remote = RemoteFlow::Ready;
        self.process_ack(channel, nr);
    }

    pub(crate) fn on_rnr(&mut self, channel: ChannelId, nr: Seq) {
        debug!(%channel, %nr, "RNR, holding data");
        self.channels[channel.index()].remote = RemoteFlow::NotReady;
        self.process_ack(channel, nr);
    }

    /// Go-back-N: everything from `nr` onward is sent again, in order
    pub(crate) fn on_reject(&mut self, channel: ChannelId, nr: Seq) {
        self.stats.rejects_received += 1;
        self.channels[channel.index()].remote = RemoteFlow::Ready;
        if !self.process_ack(channel, nr) {
            return;
        }

        let ch = &mut self.channels[channel.index()];
        let mut requeued = 0;
        while let Some(packet) = ch.unacked.pop_back() {
            if packet.header.control {
                ch.link_out.push_front(packet);
            } else {
                ch.pending_out.push_front(packet);
            }
            requeued += 1;
        }
        ch.send_seq = nr;
        ch.send_credit = ch.window;
        ch.retransmit = false;
        ch.retries[TimerClass::Rotation.index()] = 0;
        self.timers.stop(TimerClass::Rotation, channel);
        debug!(%channel, %nr, requeued, "REJECT, going back");
    }

    /// Validates and applies a piggy-backed or explicit N(R)
    ///
    /// An N(R) outside the send window resets the channel (restarts the
    /// link on channel 0) and returns false.
    pub(crate) fn process_ack(&mut self, channel: ChannelId, nr: Seq) -> bool {
        let ch = &self.channels[channel.index()];
        if ch.valid_ack_seq(nr) {
            self.apply_ack(channel, nr);
            return true;
        }

        warn!(%channel, %nr, low = %ch.ack_seq, high = %ch.send_seq, "N(R) outside send window");
        if channel.is_control() {
            self.initiate_restart(Cause::LocalProcedureError, Diagnostic::InvalidAck);
        } else {
            self.initiate_reset(channel, Cause::LocalProcedureError, Diagnostic::InvalidAck);
        }
        false
    }

    /// Queues RR, RNR or REJECT unless an identical one is already waiting
    ///
    /// An RR requested while this side is not ready goes out as RNR. If no
    /// buflet is available the frame is owed and retried from a timer.
    pub(crate) fn send_flow(&mut self, channel: ChannelId, ctype: ControlType) {
        let ch = &self.channels[channel.index()];
        let ctype = match ctype {
            ControlType::Rr if ch.local == LocalFlow::NotReady => ControlType::Rnr,
            other => other,
        };

        let already_queued = ch
            .link_out
            .iter()
            .any(|p| p.header.control && p.header.function == ctype.code());
        if already_queued {
            return;
        }

        if ctype == ControlType::Rnr {
            self.stats.rnr_sent += 1;
        }
        if self.queue_control(channel, ctype, &[]) {
            return;
        }

        let ch = &mut self.channels[channel.index()];
        match ctype {
            ControlType::Rr => ch.owed.rr = true,
            ControlType::Rnr => ch.owed.rnr = true,
            ControlType::Reject => ch.owed.reject = true,
            _ => return,
        }
        warn!(%channel, ?ctype, "no buflets for flow control frame, deferring");
        self.timers.start(
            Granularity::Fine,
            TimerClass::Defer,
            channel,
            self.config.defer_ticks,
            TimerAction::RetryDeferred,
        );
    }

    /// Sends a REJECT for the next expected frame, once per gap
    pub(crate) fn send_reject(&mut self, channel: ChannelId) {
        let ch = &mut self.channels[channel.index()];
        if ch.reject_sent {
            return;
        }
        ch.reject_sent = true;
        self.stats.rejects_sent += 1;
        debug!(%channel, expected = %ch.next_expected(), "requesting retransmission");
        self.send_flow(channel, ControlType::Reject);
    }

    /// Retries owed flow-control frames
    pub(crate) fn retry_deferred(&mut self, channel: ChannelId) {
        let owed = std::mem::take(&mut self.channels[channel.index()].owed);
        if owed.reject {
            self.send_flow(channel, ControlType::Reject);
        }
        if owed.rnr {
            self.send_flow(channel, ControlType::Rnr);
        }
        if owed.rr {
            self.send_flow(channel, ControlType::Rr);
        }
    }

    /// Free buflets below which a channel stops accepting data
    pub fn flow_threshold(&self) -> usize {
        let open = self
            .channels
            .iter()
            .filter(|c| c.phase == Phase::Reset(ResetState::FlowReady))
            .filter(|c| !c.inbound.is_empty() || !c.unacked.is_empty() || !c.pending_out.is_empty())
            .count();
        self.config.low_water + self.config.per_channel_reserve * open
    }

    /// Acknowledges an accepted frame, or goes not-ready under pressure
    pub(crate) fn acknowledge(&mut self, channel: ChannelId) {
        if self.pool.free_count() < self.flow_threshold() {
            let ch = &mut self.channels[channel.index()];
            if ch.local != LocalFlow::NotReady {
                warn!(%channel, free = self.pool.free_count(), "buffer pressure, receiver not ready");
            }
            ch.local = LocalFlow::NotReady;
            self.send_flow(channel, ControlType::Rnr);
        } else {
            self.send_flow(channel, ControlType::Rr);
        }
    }

    /// Marks a channel not ready after refusing a frame for lack of buffers
    pub(crate) fn refuse_for_resources(&mut self, channel: ChannelId) {
        self.stats.dropped_low_resource += 1;
        self.channels[channel.index()].local = LocalFlow::NotReady;
        self.send_flow(channel, ControlType::Rnr);
    }

    /// Brings channels back to ready once the pool has recovered
    ///
    /// Returns the number of channels that sent a fresh RR.
    pub fn poll_flow(&mut self) -> usize {
        let needed = self.flow_threshold() + self.config.flow_hysteresis;
        if self.pool.free_count() < needed {
            return 0;
        }

        let mut recovered = 0;
        for id in crate::core::ChannelId::all() {
            if self.channels[id.index()].local != LocalFlow::NotReady {
                continue;
            }
            self.channels[id.index()].local = LocalFlow::Transitioning;
            self.send_flow(id, ControlType::Rr);
            debug!(channel = %id, free = self.pool.free_count(), "receiver ready again");
            recovered += 1;
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkConfig;
    use crate::link::channel::RestartState;
    use crate::link::tests::{ch, data_frame, ready_engine, transmitted};
    use crate::protocol::{Assembled, Frame};

    #[test]
    fn test_rnr_suppresses_data_until_rr() {
        let mut engine = ready_engine(LinkConfig::default());
        engine.receive(Assembled::Frame(Frame::control(ch(1), ControlType::Rnr, &[]).unwrap()));
        assert_eq!(engine.channel(ch(1)).remote_flow(), RemoteFlow::NotReady);

        engine.submit(ch(1), false, 0, b"held").unwrap();
        assert!(transmitted(&mut engine).is_empty());

        engine.receive(Assembled::Frame(Frame::control(ch(1), ControlType::Rr, &[]).unwrap()));
        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..], b"held");
    }

    #[test]
    fn test_reject_requeues_unacked_in_order() {
        let config = LinkConfig { window_size: 3, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        engine.submit(ch(1), false, 0, b"n0").unwrap();
        engine.submit(ch(1), false, 0, b"n1").unwrap();
        assert_eq!(transmitted(&mut engine).len(), 2);
        engine.submit(ch(1), false, 0, b"n2").unwrap();
        assert_eq!(engine.channel(ch(1)).unacked_len(), 2);

        // Peer rejects from N(R)=0 before the third frame goes out
        engine.receive(Assembled::Frame(Frame::control(ch(1), ControlType::Reject, &[]).unwrap()));
        assert_eq!(engine.channel(ch(1)).unacked_len(), 0);
        assert_eq!(engine.channel(ch(1)).pending_len(), 3);

        let sent = transmitted(&mut engine);
        let payloads: Vec<&[u8]> = sent.iter().map(|f| &f.data[..]).collect();
        assert_eq!(payloads, vec![&b"n0"[..], b"n1", b"n2"]);
        let seqs: Vec<u8> = sent.iter().map(|f| f.header.ns.value()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(engine.stats().rejects_received, 1);
    }

    #[test]
    fn test_reject_with_partial_ack_frees_prefix() {
        let config = LinkConfig { window_size: 3, ..LinkConfig::default() };
        let mut engine = ready_engine(config);
        for payload in [b"a", b"b", b"c"] {
            engine.submit(ch(2), false, 0, payload).unwrap();
        }
        assert_eq!(transmitted(&mut engine).len(), 3);

        let mut reject = Frame::control(ch(2), ControlType::Reject, &[]).unwrap();
        reject.header.nr = Seq::new(1);
        engine.receive(Assembled::Frame(reject));

        let sent = transmitted(&mut engine);
        let payloads: Vec<&[u8]> = sent.iter().map(|f| &f.data[..]).collect();
        assert_eq!(payloads, vec![&b"b"[..], b"c"]);
        assert_eq!(sent[0].header.ns, Seq::new(1));
    }

    #[test]
    fn test_invalid_ack_resets_channel() {
        let mut engine = ready_engine(LinkConfig::default());
        let mut rr = Frame::control(ch(4), ControlType::Rr, &[]).unwrap();
        rr.header.nr = Seq::new(9);
        engine.receive(Assembled::Frame(rr));
        assert_eq!(engine.channel(ch(4)).reset_state(), Some(ResetState::ResetPending));

        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].control_type(), Some(ControlType::Reset));
        assert_eq!(&sent[0].data[..], &[Cause::LocalProcedureError.code(), Diagnostic::InvalidAck.code()]);
    }

    #[test]
    fn test_low_resources_refuse_data_with_rnr() {
        let config = LinkConfig {
            pool_size: 64,
            critical_low_water: 8,
            low_water: 12,
            ..LinkConfig::default()
        };
        let mut engine = ready_engine(config);

        // Drive the pool down to the critical mark
        let mut hoard = Vec::new();
        while engine.pool.free_count() > 8 {
            hoard.push(engine.pool.alloc(1).unwrap());
        }

        engine.receive(Assembled::Frame(data_frame(ch(1), 0, b"dropped")));
        assert_eq!(engine.channel(ch(1)).inbound_len(), 0);
        assert_eq!(engine.channel(ch(1)).last_received(), Seq::new(15));
        assert_eq!(engine.channel(ch(1)).local_flow(), LocalFlow::NotReady);
        assert_eq!(engine.stats().dropped_low_resource, 1);

        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].control_type(), Some(ControlType::Rnr));
        assert_eq!(sent[0].header.channel, ch(1));

        // Recovery sends a fresh RR once buflets are back
        assert_eq!(engine.poll_flow(), 0);
        for chain in hoard.drain(..) {
            engine.pool.free(chain);
        }
        assert_eq!(engine.poll_flow(), 1);
        assert_eq!(engine.channel(ch(1)).local_flow(), LocalFlow::Transitioning);
        let sent = transmitted(&mut engine);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].control_type(), Some(ControlType::Rr));
        assert_eq!(engine.channel(ch(1)).local_flow(), LocalFlow::Ready);
    }

    #[test]
    fn test_pressure_after_accept_sends_rnr() {
        let config = LinkConfig {
            pool_size: 64,
            critical_low_water: 4,
            low_water: 40,
            ..LinkConfig::default()
        };
        let mut engine = ready_engine(config);
        let mut hoard = Vec::new();
        while engine.pool.free_count() > 30 {
            hoard.push(engine.pool.alloc(1).unwrap());
        }

        engine.receive(Assembled::Frame(data_frame(ch(1), 0, b"kept")));
        assert_eq!(engine.channel(ch(1)).inbound_len(), 1);
        assert_eq!(engine.channel(ch(1)).local_flow(), LocalFlow::NotReady);
        let sent = transmitted(&mut engine);
        assert_eq!(sent[0].control_type(), Some(ControlType::Rnr));
        assert_eq!(sent[0].header.nr, Seq::new(1));

        for chain in hoard.drain(..) {
            engine.pool.free(chain);
        }
    }

    #[test]
    fn test_flow_frames_ignored_during_restart() {
        let mut engine = crate::link::LinkEngine::new(LinkConfig::default()).unwrap();
        engine.receive(Assembled::Frame(Frame::control(ch(1), ControlType::Rnr, &[]).unwrap()));
        assert_eq!(engine.channel(ch(1)).remote_flow(), RemoteFlow::Ready);
        assert_eq!(engine.restart_state(), RestartState::WaitingForRestart);
    }
}
