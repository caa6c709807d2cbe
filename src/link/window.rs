//! Sequence and window management
//!
//! All comparisons are circular modulo 16. The send side tracks the oldest
//! unacknowledged N(S) and the next N(S) to assign; the receive side tracks
//! the last accepted N(S) and a receive window that rotates every time an
//! acknowledgment goes out.

use tracing::{debug, trace};

use crate::core::{ChannelId, Seq};
use crate::timer::{Granularity, TimerAction, TimerClass};
use super::channel::Channel;
use super::LinkEngine;

/// Outcome of checking an incoming N(S)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// Exactly the next expected frame
    Ok,
    /// Same as the last accepted frame; the peer missed our ack
    Duplicate,
    /// Anything else
    Error,
}

impl Channel {
    pub fn valid_receive_seq(&self, seq: Seq) -> SeqCheck {
        if seq == self.last_recv {
            SeqCheck::Duplicate
        } else if seq != self.last_recv.next() {
            SeqCheck::Error
        } else {
            SeqCheck::Ok
        }
    }

    /// Whether `ack` lies in `[oldest unacknowledged, next to send]`
    pub fn valid_ack_seq(&self, ack: Seq) -> bool {
        ack.in_range(self.ack_seq, self.send_seq)
    }

    /// Circular receive window check
    ///
    /// Data frames (Q-bit clear) also spend the per-window budget, so the
    /// peer cannot push more data than one window between our acks.
    pub fn in_receive_window(&mut self, seq: Seq, spends_budget: bool) -> bool {
        if !seq.in_range(self.recv_low, self.recv_high) {
            return false;
        }
        if spends_budget {
            if self.recv_budget == 0 {
                return false;
            }
            self.recv_budget -= 1;
        }
        true
    }

    /// Re-centres the receive window after an acknowledgment is sent
    pub(crate) fn rotate_receive_window(&mut self) {
        self.recv_low = self.last_recv.next();
        self.recv_high = self.recv_low.add(self.window - 1);
        self.recv_budget = self.window;
    }

    /// Current send window bounds
    pub fn send_window(&self) -> (Seq, Seq) {
        (self.ack_seq, self.ack_seq.add(self.window - 1))
    }

    fn recompute_credit(&mut self) {
        let outstanding = self.unacked.len().min(self.window as usize) as u8;
        self.send_credit = self.window - outstanding;
    }
}

impl LinkEngine {
    /// Frees every unacknowledged frame preceding `ack`
    ///
    /// Returns the number of frames released. The caller has checked `ack`
    /// with [`Channel::valid_ack_seq`].
    pub(crate) fn apply_ack(&mut self, channel: ChannelId, ack: Seq) -> usize {
        let ch = &mut self.channels[channel.index()];
        let span = ch.ack_seq.distance_to(ack);
        let mut released = 0;

        while let Some(front) = ch.unacked.front() {
            if ch.ack_seq.distance_to(front.header.ns) >= span {
                break;
            }
            if let Some(packet) = ch.unacked.pop_front() {
                trace!(%channel, seq = %packet.header.ns, "acknowledged");
                self.pool.free(packet.chain);
                released += 1;
            }
        }

        ch.ack_seq = ack;
        ch.recompute_credit();

        if released > 0 {
            ch.retries[TimerClass::Rotation.index()] = 0;
            debug!(%channel, %ack, released, credit = ch.send_credit, "window advanced");
        }

        if !channel.is_control() {
            if ch.unacked.is_empty() {
                ch.retransmit = false;
                self.timers.stop(TimerClass::Rotation, channel);
            } else if released > 0 {
                self.timers.start(
                    Granularity::Medium,
                    TimerClass::Rotation,
                    channel,
                    self.config.rotation_ticks,
                    TimerAction::FlagRetransmit,
                );
            }
        }

        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkConfig;
    use crate::link::channel::Packet;
    use crate::protocol::Frame;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    /// Puts `count` sequenced frames into a channel's unacknowledged queue
    fn fill_unacked(engine: &mut LinkEngine, channel: ChannelId, start: u8, count: u8) {
        let window = engine.config.window_size;
        let c = &mut engine.channels[channel.index()];
        c.ack_seq = Seq::new(start);
        c.send_seq = Seq::new(start);
        for _ in 0..count {
            let mut header = Frame::data(channel, false, 0, &[]).unwrap().header;
            header.ns = c.send_seq;
            let chain = engine.pool.alloc(1).unwrap();
            c.unacked.push_back(Packet { header, chain });
            c.send_seq = c.send_seq.next();
        }
        c.send_credit = window - count;
    }

    fn engine_with_window(window: u8) -> LinkEngine {
        let config = LinkConfig {
            window_size: window,
            ..LinkConfig::default()
        };
        LinkEngine::new(config).unwrap()
    }

    #[test]
    fn test_receive_seq_classification() {
        let mut c = Channel::new(ch(1), 2);
        c.last_recv = Seq::new(4);
        assert_eq!(c.valid_receive_seq(Seq::new(5)), SeqCheck::Ok);
        assert_eq!(c.valid_receive_seq(Seq::new(4)), SeqCheck::Duplicate);
        assert_eq!(c.valid_receive_seq(Seq::new(7)), SeqCheck::Error);

        c.last_recv = Seq::new(15);
        assert_eq!(c.valid_receive_seq(Seq::new(0)), SeqCheck::Ok);
    }

    #[test]
    fn test_ack_range_wraps() {
        let mut c = Channel::new(ch(1), 4);
        c.ack_seq = Seq::new(14);
        c.send_seq = Seq::new(1);
        for ok in [14, 15, 0, 1] {
            assert!(c.valid_ack_seq(Seq::new(ok)), "{} should be valid", ok);
        }
        for bad in [2, 8, 13] {
            assert!(!c.valid_ack_seq(Seq::new(bad)), "{} should be invalid", bad);
        }
    }

    #[test]
    fn test_receive_window_boundary() {
        let mut c = Channel::new(ch(1), 2);
        // Window is 0..=1 after a reset
        assert!(c.in_receive_window(Seq::new(1), false));
        assert!(!c.in_receive_window(Seq::new(2), false));
    }

    #[test]
    fn test_receive_budget_limits_data_frames() {
        let mut c = Channel::new(ch(1), 2);
        assert!(c.in_receive_window(Seq::new(0), true));
        assert!(c.in_receive_window(Seq::new(1), true));
        assert!(!c.in_receive_window(Seq::new(1), true));
        // Qualified frames do not spend the budget
        assert!(c.in_receive_window(Seq::new(1), false));

        c.last_recv = Seq::new(1);
        c.rotate_receive_window();
        assert_eq!(c.receive_window(), (Seq::new(2), Seq::new(3)));
        assert!(c.in_receive_window(Seq::new(2), true));
    }

    #[test]
    fn test_apply_ack_releases_prefix_only() {
        let mut engine = engine_with_window(4);
        let free_before = engine.pool.free_count();
        fill_unacked(&mut engine, ch(2), 14, 4); // 14, 15, 0, 1

        let released = engine.apply_ack(ch(2), Seq::new(0));
        assert_eq!(released, 2);
        let c = &engine.channels[2];
        let remaining: Vec<u8> = c.unacked.iter().map(|p| p.header.ns.value()).collect();
        assert_eq!(remaining, vec![0, 1]);
        assert_eq!(c.ack_seq, Seq::new(0));
        assert_eq!(c.send_credit, 2);
        assert_eq!(engine.pool.free_count(), free_before - 2);
    }

    #[test]
    fn test_apply_ack_of_everything_stops_rotation_timer() {
        let mut engine = engine_with_window(3);
        fill_unacked(&mut engine, ch(1), 0, 2);
        engine.timers.start(Granularity::Medium, TimerClass::Rotation, ch(1), 5, TimerAction::FlagRetransmit);

        assert_eq!(engine.apply_ack(ch(1), Seq::new(2)), 2);
        assert!(!engine.timers.is_active(TimerClass::Rotation, ch(1)));
        assert_eq!(engine.channels[1].send_credit, 3);
    }

    #[test]
    fn test_apply_ack_same_value_releases_nothing() {
        let mut engine = engine_with_window(2);
        fill_unacked(&mut engine, ch(1), 5, 2);
        assert_eq!(engine.apply_ack(ch(1), Seq::new(5)), 0);
        assert_eq!(engine.channels[1].unacked_len(), 2);
    }

    #[test]
    fn test_random_acks_release_exact_prefix() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x0A11);

        for _ in 0..200 {
            let window = rng.gen_range(1..=7u8);
            let mut engine = engine_with_window(window);
            let start = rng.gen_range(0..16u8);
            let count = rng.gen_range(0..=window);
            fill_unacked(&mut engine, ch(3), start, count);

            let ack = Seq::new(start).add(rng.gen_range(0..=count));
            assert!(engine.channels[3].valid_ack_seq(ack));
            let expected_left = Seq::new(start).add(count);

            let released = engine.apply_ack(ch(3), ack);
            assert_eq!(released as u8, Seq::new(start).distance_to(ack));
            let c = &engine.channels[3];
            assert_eq!(c.unacked_len() as u8, ack.distance_to(expected_left));
            if let Some(front) = c.unacked.front() {
                assert_eq!(front.header.ns, ack);
            }
            assert!(c.unacked_len() <= window as usize);
        }
    }
}
