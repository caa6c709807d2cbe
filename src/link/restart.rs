//! Restart (channel 0) and reset (channels 1-15) handshakes
//!
//! Both follow the same shape: the initiator clears state, sends the
//! request with a cause and diagnostic, and resends it from a coarse timer
//! until confirmed or out of retries. A request that crosses ours on the
//! wire counts as the confirmation.

use tracing::{debug, error, info, warn};

use crate::buffer::Chained;
use crate::core::ChannelId;
use crate::protocol::{Cause, ControlType, Diagnostic, Frame};
use crate::timer::{Granularity, TimerAction, TimerClass};
use super::channel::{Packet, Phase, ResetState, RestartState};
use super::{LinkEngine, LinkEvent};

/// Splits RESET/RESTART extra data into cause and optional diagnostic
fn parse_cause(data: &[u8]) -> Option<(Cause, Option<Diagnostic>)> {
    match *data {
        [cause] => Some((Cause::from(cause), None)),
        [cause, diag] => Some((Cause::from(cause), Some(Diagnostic::from(diag)))),
        _ => None,
    }
}

impl LinkEngine {
    /// Builds a control frame into a chain on the channel's control queue
    ///
    /// Returns false if the pool could not supply a buflet.
    pub(crate) fn queue_control(&mut self, channel: ChannelId, ctype: ControlType, data: &[u8]) -> bool {
        let frame = match Frame::control(channel, ctype, data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%channel, ?ctype, "cannot build control frame: {}", e);
                return false;
            }
        };
        let Some(chain) = self.pool.alloc_with(&frame.to_bytes()) else {
            return false;
        };
        self.channels[channel.index()].link_out.push_back(Packet {
            header: frame.header,
            chain,
        });
        true
    }

    fn control_queued(&self, channel: ChannelId, ctype: ControlType) -> bool {
        self.channels[channel.index()]
            .link_out
            .iter()
            .any(|p| p.header.control_type() == Some(ctype))
    }

    /// Drops every queued copy of a RESTART or RESET once the peer has answered
    fn withdraw_request(&mut self, channel: ChannelId, ctype: ControlType) {
        let ch = &mut self.channels[channel.index()];
        loop {
            let found = ch
                .link_out
                .iter()
                .find(|p| p.header.control_type() == Some(ctype))
                .map(|p| p.chain_id());
            let Some(id) = found else {
                break;
            };
            let Some(packet) = ch.link_out.remove(id) else {
                break;
            };
            debug!(%channel, ?ctype, "queued retry withdrawn");
            self.pool.free(packet.chain);
        }
    }

    /// Whether an earlier copy of our request already went out
    fn request_sent(&self, channel: ChannelId, class: TimerClass) -> bool {
        self.channels[channel.index()].retries[class.index()] > 0
    }

    /// Reports a protocol problem to the peer on channel 0
    pub(crate) fn send_diag(&mut self, diag: Diagnostic) {
        if !self.is_ready() {
            debug!(?diag, "link not ready, diagnostic not sent");
            return;
        }
        warn!(?diag, "sending diagnostic");
        if self.queue_control(ChannelId::CONTROL, ControlType::Diag, &[diag.code()]) {
            self.stats.diagnostics_sent += 1;
        }
    }

    fn reset_all_channels(&mut self) {
        self.slots.discard_staged(None, &mut self.pool);
        for ch in self.channels.iter_mut() {
            ch.clear_outbound(&mut self.pool);
            ch.reset_window();
            if let Phase::Reset(_) = ch.phase {
                ch.phase = Phase::Reset(ResetState::FlowReady);
            }
            self.timers.stop_channel(ch.id);
        }
    }

    /// Restarts the whole link from this side
    pub(crate) fn initiate_restart(&mut self, cause: Cause, diag: Diagnostic) {
        info!(?cause, ?diag, "initiating restart");
        self.reset_all_channels();

        let control = ChannelId::CONTROL;
        let ch = &mut self.channels[control.index()];
        ch.phase = Phase::Restart(RestartState::RestartPending);
        ch.last_cause = [cause.code(), diag.code()];

        let data = ch.last_cause;
        self.queue_control(control, ControlType::Restart, &data);
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Restart,
            control,
            self.config.restart_ticks,
            TimerAction::ResendRestart,
        );
    }

    pub(crate) fn on_restart(&mut self, data: &[u8]) {
        let Some((cause, diag)) = parse_cause(data) else {
            warn!(len = data.len(), "malformed RESTART");
            self.initiate_restart(Cause::LocalProcedureError, Diagnostic::MalformedCause);
            return;
        };

        if self.restart_state() == RestartState::RestartPending {
            debug!(?cause, "restart collision, treating as confirmation");
            // An unsent first request still serves as the peer's confirmation
            if self.request_sent(ChannelId::CONTROL, TimerClass::Restart) {
                self.withdraw_request(ChannelId::CONTROL, ControlType::Restart);
            }
            self.complete_restart(cause);
            return;
        }

        info!(?cause, ?diag, "peer restarted the link");
        self.reset_all_channels();
        self.queue_control(ChannelId::CONTROL, ControlType::RestartConfirm, &[]);
        self.complete_restart(cause);
    }

    pub(crate) fn on_restart_confirm(&mut self, data: &[u8]) {
        if !data.is_empty() {
            warn!(len = data.len(), "malformed RESTART CONFIRM");
            self.initiate_restart(Cause::LocalProcedureError, Diagnostic::MalformedCause);
            return;
        }
        match self.restart_state() {
            RestartState::RestartPending => {
                self.withdraw_request(ChannelId::CONTROL, ControlType::Restart);
                let cause = Cause::from(self.channels[ChannelId::CONTROL.index()].last_cause[0]);
                self.complete_restart(cause);
            }
            RestartState::PacketReady => self.send_diag(Diagnostic::UnexpectedConfirm),
            RestartState::WaitingForRestart => warn!("RESTART CONFIRM without a restart"),
        }
    }

    fn complete_restart(&mut self, cause: Cause) {
        let control = ChannelId::CONTROL;
        self.timers.stop(TimerClass::Restart, control);
        for ch in self.channels.iter_mut() {
            ch.reset_window();
            ch.phase = match ch.phase {
                Phase::Restart(_) => Phase::Restart(RestartState::PacketReady),
                Phase::Reset(_) => Phase::Reset(ResetState::FlowReady),
            };
        }
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Keepalive,
            control,
            self.config.keepalive_ticks,
            TimerAction::SendKeepalive,
        );
        info!(?cause, "link restarted, packet ready");
        self.emit(LinkEvent::Restarted { cause });
    }

    pub(crate) fn on_restart_timer(&mut self) {
        if self.restart_state() != RestartState::RestartPending {
            return;
        }
        let control = ChannelId::CONTROL;
        let limit = self.config.restart_retries;
        let ch = &mut self.channels[control.index()];
        let retries = &mut ch.retries[TimerClass::Restart.index()];

        if *retries >= limit {
            error!(retries = *retries, "restart not confirmed, peer lost");
            for ch in self.channels.iter_mut().filter(|c| !c.id.is_control()) {
                ch.phase = Phase::Reset(ResetState::Cleared);
                ch.clear_outbound(&mut self.pool);
            }
            self.emit(LinkEvent::PeerLost { channel: control });
            return;
        }

        *retries += 1;
        debug!(attempt = *retries, "resending RESTART");
        let data = ch.last_cause;
        if !self.control_queued(control, ControlType::Restart) {
            self.queue_control(control, ControlType::Restart, &data);
        }
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Restart,
            control,
            self.config.restart_ticks,
            TimerAction::ResendRestart,
        );
    }

    pub(crate) fn on_keepalive(&mut self) {
        if !self.is_ready() {
            return;
        }
        self.send_flow(ChannelId::CONTROL, ControlType::Rr);
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Keepalive,
            ChannelId::CONTROL,
            self.config.keepalive_ticks,
            TimerAction::SendKeepalive,
        );
    }

    /// Clears one session channel's queues and window
    fn clear_channel(&mut self, channel: ChannelId) {
        self.slots.discard_staged(Some(channel), &mut self.pool);
        self.timers.stop_channel(channel);
        let ch = &mut self.channels[channel.index()];
        ch.clear_outbound(&mut self.pool);
        ch.reset_window();
    }

    /// Resets a session channel from this side
    pub(crate) fn initiate_reset(&mut self, channel: ChannelId, cause: Cause, diag: Diagnostic) {
        if !self.is_ready() {
            debug!(%channel, "restart in progress, reset not sent");
            return;
        }
        info!(%channel, ?cause, ?diag, "initiating reset");
        self.clear_channel(channel);

        let ch = &mut self.channels[channel.index()];
        ch.phase = Phase::Reset(ResetState::ResetPending);
        ch.last_cause = [cause.code(), diag.code()];

        let data = ch.last_cause;
        self.queue_control(channel, ControlType::Reset, &data);
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Reset,
            channel,
            self.config.reset_ticks,
            TimerAction::ResendReset,
        );
    }

    pub(crate) fn on_reset(&mut self, channel: ChannelId, data: &[u8]) {
        let Some((cause, diag)) = parse_cause(data) else {
            warn!(%channel, len = data.len(), "malformed RESET");
            self.initiate_reset(channel, Cause::LocalProcedureError, Diagnostic::MalformedCause);
            return;
        };

        if self.channels[channel.index()].reset_state() == Some(ResetState::ResetPending) {
            debug!(%channel, "reset collision, treating as confirmation");
            if self.request_sent(channel, TimerClass::Reset) {
                self.withdraw_request(channel, ControlType::Reset);
            }
            self.complete_reset(channel, cause);
            return;
        }

        info!(%channel, ?cause, ?diag, "peer reset channel");
        self.clear_channel(channel);
        self.queue_control(channel, ControlType::ResetConfirm, &[]);
        self.complete_reset(channel, cause);
    }

    pub(crate) fn on_reset_confirm(&mut self, channel: ChannelId, data: &[u8]) {
        if !data.is_empty() {
            warn!(%channel, len = data.len(), "malformed RESET CONFIRM");
            self.initiate_reset(channel, Cause::LocalProcedureError, Diagnostic::MalformedCause);
            return;
        }
        match self.channels[channel.index()].reset_state() {
            Some(ResetState::ResetPending) => {
                self.withdraw_request(channel, ControlType::Reset);
                let cause = Cause::from(self.channels[channel.index()].last_cause[0]);
                self.complete_reset(channel, cause);
            }
            Some(ResetState::FlowReady) => self.send_diag(Diagnostic::UnexpectedConfirm),
            _ => debug!(%channel, "RESET CONFIRM on cleared channel ignored"),
        }
    }

    fn complete_reset(&mut self, channel: ChannelId, cause: Cause) {
        self.timers.stop(TimerClass::Reset, channel);
        let ch = &mut self.channels[channel.index()];
        ch.reset_window();
        ch.phase = Phase::Reset(ResetState::FlowReady);
        info!(%channel, ?cause, "channel reset complete");
        self.emit(LinkEvent::ChannelReset { channel, cause });
    }

    pub(crate) fn on_reset_timer(&mut self, channel: ChannelId) {
        if self.channels[channel.index()].reset_state() != Some(ResetState::ResetPending) {
            return;
        }
        let limit = self.config.reset_retries;
        let ch = &mut self.channels[channel.index()];
        let retries = &mut ch.retries[TimerClass::Reset.index()];

        if *retries >= limit {
            error!(%channel, retries = *retries, "reset not confirmed, peer lost");
            ch.phase = Phase::Reset(ResetState::Cleared);
            ch.clear_outbound(&mut self.pool);
            self.emit(LinkEvent::PeerLost { channel });
            return;
        }

        *retries += 1;
        debug!(%channel, attempt = *retries, "resending RESET");
        let data = ch.last_cause;
        if !self.control_queued(channel, ControlType::Reset) {
            self.queue_control(channel, ControlType::Reset, &data);
        }
        self.timers.start(
            Granularity::Coarse,
            TimerClass::Reset,
            channel,
            self.config.reset_ticks,
            TimerAction::ResendReset,
        );
    }
}
