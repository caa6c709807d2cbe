//! Inbound frame validation and dispatch

use tracing::{debug, trace, warn};

use crate::core::{ChannelId, Seq};
use crate::protocol::{Assembled, Cause, ControlType, Diagnostic, Frame, Header};
use super::channel::{Packet, ResetState};
use super::window::SeqCheck;
use super::{LinkEngine, LinkEvent};

impl LinkEngine {
    /// Processes one assembled frame
    pub fn receive(&mut self, item: Assembled) {
        match item {
            Assembled::Frame(frame) => {
                self.stats.frames_in += 1;
                trace!(channel = %frame.header.channel, function = frame.header.function, "frame in");
                if frame.header.control {
                    self.on_control(frame);
                } else {
                    self.on_data(frame);
                }
            }
            Assembled::CorruptData(header) => self.on_corrupt_data(header),
        }
    }

    /// Whether sequenced traffic is flowing on a channel
    fn accepts_traffic(&self, channel: ChannelId) -> bool {
        if !self.is_ready() {
            return false;
        }
        channel.is_control()
            || self.channels[channel.index()].reset_state() == Some(ResetState::FlowReady)
    }

    fn on_corrupt_data(&mut self, header: Header) {
        if header.is_sequenced() {
            if self.accepts_traffic(header.channel) {
                debug!(channel = %header.channel, ns = %header.ns, "damaged extra data, rejecting");
                self.send_reject(header.channel);
            }
            return;
        }
        // Unsequenced frames have nothing to reject; the sender's retry timer resends them
        warn!(channel = %header.channel, ctype = ?header.control_type(), "damaged control frame data");
        self.send_diag(Diagnostic::DataCrcError);
    }

    fn on_data(&mut self, frame: Frame) {
        let channel = frame.header.channel;
        if frame.header.reserved != 0 {
            warn!(%channel, flags = frame.header.flags(), "reserved bits set on data frame");
            self.send_diag(Diagnostic::InvalidFlags);
            return;
        }
        if channel.is_control() {
            warn!("data frame on channel 0");
            self.send_diag(Diagnostic::DataOnControlChannel);
            return;
        }
        if !self.accepts_traffic(channel) {
            debug!(%channel, "channel not accepting data, dropped");
            return;
        }
        if self.pool.free_count() <= self.config.critical_low_water {
            warn!(%channel, free = self.pool.free_count(), "pool critical, refusing data");
            self.refuse_for_resources(channel);
            return;
        }
        if !self.process_ack(channel, frame.header.nr) {
            return;
        }
        if !self.check_sequence(channel, frame.header.ns) {
            return;
        }

        let Some(chain) = self.pool.alloc_with(&frame.data) else {
            self.refuse_for_resources(channel);
            return;
        };
        if !self.channels[channel.index()].in_receive_window(frame.header.ns, !frame.header.qualifier) {
            self.pool.free(chain);
            self.receive_window_exceeded(channel, frame.header.ns);
            return;
        }

        self.commit_sequence(channel, frame.header.ns);
        self.channels[channel.index()].inbound.push_back(Packet {
            header: frame.header,
            chain,
        });
        debug!(%channel, ns = %frame.header.ns, len = frame.data.len(), "delivered");
        self.emit(LinkEvent::FrameDelivered { channel });
        self.acknowledge(channel);
    }

    /// Screens N(S) of a sequenced frame before it is accepted
    ///
    /// Duplicates are re-acknowledged, gaps draw a REJECT and anything ahead
    /// of the receive window resets the channel. Returns true only for the
    /// next expected frame.
    fn check_sequence(&mut self, channel: ChannelId, ns: Seq) -> bool {
        let ch = &self.channels[channel.index()];
        let check = ch.valid_receive_seq(ns);
        let stale_low = ch.last_recv.add(Seq::MODULUS - (ch.window - 1));
        let (low, high) = ch.receive_window();

        if check == SeqCheck::Duplicate || ns.in_range(stale_low, ch.last_recv) {
            trace!(%channel, %ns, "duplicate, re-acknowledging");
            self.stats.duplicates += 1;
            self.send_flow(channel, ControlType::Rr);
            return false;
        }
        if !ns.in_range(low, high) {
            self.receive_window_exceeded(channel, ns);
            return false;
        }
        if check == SeqCheck::Error {
            debug!(%channel, %ns, expected = %ch.next_expected(), "out of sequence");
            self.send_reject(channel);
            return false;
        }
        true
    }

    fn commit_sequence(&mut self, channel: ChannelId, ns: Seq) {
        let ch = &mut self.channels[channel.index()];
        ch.last_recv = ns;
        ch.reject_sent = false;
    }

    fn receive_window_exceeded(&mut self, channel: ChannelId, ns: Seq) {
        let (low, high) = self.channels[channel.index()].receive_window();
        warn!(%channel, %ns, %low, %high, "frame outside receive window");
        let cause = Cause::LocalProcedureError;
        if channel.is_control() {
            self.initiate_restart(cause, Diagnostic::OutOfWindow);
        } else {
            self.initiate_reset(channel, cause, Diagnostic::OutOfWindow);
        }
    }

    fn on_control(&mut self, frame: Frame) {
        let channel = frame.header.channel;
        let Some(ctype) = frame.control_type() else {
            warn!(%channel, function = frame.header.function, "unknown control type");
            self.send_diag(Diagnostic::UnknownControlType);
            return;
        };
        if frame.header.reserved != 0 || frame.header.qualifier {
            warn!(%channel, ?ctype, flags = frame.header.flags(), "invalid flags on control frame");
            if ctype != ControlType::Diag {
                self.send_diag(Diagnostic::InvalidFlags);
            }
            return;
        }

        match ctype {
            ControlType::Restart | ControlType::RestartConfirm if !channel.is_control() => {
                warn!(%channel, ?ctype, "restart on a session channel");
                self.send_diag(Diagnostic::WrongChannel);
            }
            ControlType::Reset | ControlType::ResetConfirm if channel.is_control() => {
                warn!(?ctype, "reset on channel 0");
                self.send_diag(Diagnostic::WrongChannel);
            }
            ControlType::Diag if !channel.is_control() => {
                warn!(%channel, "DIAG on a session channel ignored");
            }
            ControlType::Restart => self.on_restart(&frame.data),
            ControlType::RestartConfirm => self.on_restart_confirm(&frame.data),
            _ if !self.is_ready() => {
                if channel.is_control() {
                    debug!(?ctype, "control frame during restart, resetting channel 0 window");
                    self.channels[channel.index()].reset_window();
                } else {
                    trace!(%channel, ?ctype, "restart in progress, dropped");
                }
            }
            ControlType::Reset => self.on_reset(channel, &frame.data),
            ControlType::ResetConfirm => self.on_reset_confirm(channel, &frame.data),
            _ if !self.accepts_traffic(channel) => {
                trace!(%channel, ?ctype, "channel not flowing, dropped");
            }
            ControlType::Rr => self.on_rr(channel, frame.header.nr),
            ControlType::Rnr => self.on_rnr(channel, frame.header.nr),
            ControlType::Reject => self.on_reject(channel, frame.header.nr),
            ControlType::Diag => self.on_diag(frame),
        }
    }

    /// DIAG on channel 0 is sequenced like data; it is never answered with a DIAG
    fn on_diag(&mut self, frame: Frame) {
        let control = ChannelId::CONTROL;
        if !self.process_ack(control, frame.header.nr) || !self.check_sequence(control, frame.header.ns) {
            return;
        }
        if !self.channels[control.index()].in_receive_window(frame.header.ns, false) {
            self.receive_window_exceeded(control, frame.header.ns);
            return;
        }
        self.commit_sequence(control, frame.header.ns);

        match *frame.data {
            [code] => {
                let code = Diagnostic::from(code);
                warn!(?code, "peer reported diagnostic");
                self.emit(LinkEvent::Diagnostic { code });
            }
            _ => warn!(len = frame.data.len(), "DIAG with malformed code ignored"),
        }
        self.acknowledge(control);
    }
}
