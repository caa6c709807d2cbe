//! Timer subsystem
//!
//! Three independent tick sources (coarse, medium and fine) each drive one
//! list of active timers. Timers live in a fixed table addressed by
//! `(TimerClass, ChannelId)`, so starting, stopping and firing never
//! allocate. A timer is active exactly when it holds an action.
//!
//! Expiry does not call back into the engine directly: [`TimerTable::tick`]
//! hands back the expired identities with their [`TimerAction`] and the
//! engine dispatches on it, re-checking its own state first.

use tracing::trace;

use crate::core::{ChannelId, GRANULARITIES, MAX_CHANNELS};

/// Tick source driving a timer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Coarse,
    Medium,
    Fine,
}

impl Granularity {
    pub const ALL: [Granularity; GRANULARITIES] =
        [Granularity::Coarse, Granularity::Medium, Granularity::Fine];

    fn index(self) -> usize {
        match self {
            Granularity::Coarse => 0,
            Granularity::Medium => 1,
            Granularity::Fine => 2,
        }
    }
}

/// Kind of timer; each channel owns at most one of each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// RESTART resend (channel 0)
    Restart,
    /// RESET resend (channels 1-15)
    Reset,
    /// Window rotation / retransmission
    Rotation,
    /// Periodic RR on channel 0
    Keepalive,
    /// Retry of a control frame that could not be allocated
    Defer,
}

impl TimerClass {
    pub const COUNT: usize = 5;

    pub const ALL: [TimerClass; TimerClass::COUNT] = [
        TimerClass::Restart,
        TimerClass::Reset,
        TimerClass::Rotation,
        TimerClass::Keepalive,
        TimerClass::Defer,
    ];

    pub fn index(self) -> usize {
        match self {
            TimerClass::Restart => 0,
            TimerClass::Reset => 1,
            TimerClass::Rotation => 2,
            TimerClass::Keepalive => 3,
            TimerClass::Defer => 4,
        }
    }
}

/// What the engine should do when a timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    ResendRestart,
    ResendReset,
    FlagRetransmit,
    SendKeepalive,
    RetryDeferred,
}

/// Identity of one timer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub class: TimerClass,
    pub channel: ChannelId,
}

/// A timer that reached zero on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: TimerId,
    pub action: TimerAction,
}

#[derive(Debug, Clone, Copy)]
struct TimerSlot {
    granularity: Granularity,
    length: u32,
    action: Option<TimerAction>,
}

impl TimerSlot {
    const IDLE: TimerSlot = TimerSlot {
        granularity: Granularity::Coarse,
        length: 0,
        action: None,
    };
}

/// Fixed table of every timer on the link
pub struct TimerTable {
    slots: [[TimerSlot; MAX_CHANNELS]; TimerClass::COUNT],
    lists: [Vec<TimerId>; GRANULARITIES],
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerTable {
    pub fn new() -> Self {
        let capacity = MAX_CHANNELS * TimerClass::COUNT;
        TimerTable {
            slots: [[TimerSlot::IDLE; MAX_CHANNELS]; TimerClass::COUNT],
            lists: [
                Vec::with_capacity(capacity),
                Vec::with_capacity(capacity),
                Vec::with_capacity(capacity),
            ],
        }
    }

    /// Activates a timer, or re-arms it with a new length and action
    pub fn start(
        &mut self,
        granularity: Granularity,
        class: TimerClass,
        channel: ChannelId,
        length: u32,
        action: TimerAction,
    ) {
        let id = TimerId { class, channel };
        let slot = self.slots[class.index()][channel.index()];

        match slot.action {
            None => self.lists[granularity.index()].push(id),
            Some(_) if slot.granularity != granularity => {
                self.unlink(slot.granularity, id);
                self.lists[granularity.index()].push(id);
            }
            Some(_) => {}
        }

        let slot = &mut self.slots[class.index()][channel.index()];
        slot.granularity = granularity;
        slot.length = length;
        slot.action = Some(action);
        trace!(?class, %channel, length, "timer started");
    }

    /// Deactivates a timer; stopping an idle timer is a no-op
    pub fn stop(&mut self, class: TimerClass, channel: ChannelId) {
        let id = TimerId { class, channel };
        let slot = &mut self.slots[class.index()][channel.index()];
        if slot.action.take().is_some() {
            let granularity = slot.granularity;
            self.unlink(granularity, id);
            trace!(?class, %channel, "timer stopped");
        }
    }

    /// Stops every timer owned by a channel
    pub fn stop_channel(&mut self, channel: ChannelId) {
        for class in TimerClass::ALL {
            self.stop(class, channel);
        }
    }

    pub fn is_active(&self, class: TimerClass, channel: ChannelId) -> bool {
        self.slots[class.index()][channel.index()].action.is_some()
    }

    /// Ticks left before an active timer fires
    pub fn remaining(&self, class: TimerClass, channel: ChannelId) -> Option<u32> {
        let slot = &self.slots[class.index()][channel.index()];
        slot.action.map(|_| slot.length)
    }

    /// Number of timers linked on a granularity's list
    pub fn active_count(&self, granularity: Granularity) -> usize {
        self.lists[granularity.index()].len()
    }

    /// Advances one tick source, appending expired timers to `fired`
    ///
    /// Expired timers are already inactive when returned; the action may
    /// restart them.
    pub fn tick(&mut self, granularity: Granularity, fired: &mut Vec<Expired>) {
        let list = &mut self.lists[granularity.index()];
        let slots = &mut self.slots;

        list.retain(|id| {
            let slot = &mut slots[id.class.index()][id.channel.index()];
            slot.length = slot.length.saturating_sub(1);
            if slot.length > 0 {
                return true;
            }
            if let Some(action) = slot.action.take() {
                fired.push(Expired { id: *id, action });
            }
            false
        });
    }

    fn unlink(&mut self, granularity: Granularity, id: TimerId) {
        let list = &mut self.lists[granularity.index()];
        if let Some(pos) = list.iter().position(|t| *t == id) {
            list.swap_remove(pos);
        }
    }
}
