use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::{ChannelId, Error, LinkConfig, Result};
use crate::link::{Delivered, LinkEngine, LinkEvent, LinkStats};
use crate::protocol::Cause;
use crate::timer::Granularity;

const COMMAND_QUEUE: usize = 64;
const NOTICE_QUEUE: usize = 64;

/// A staged frame on its way to the line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Transmit slot to report back once written
    pub slot: usize,
    pub bytes: Bytes,
}

/// What the driver passes up to the session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Frame(Delivered),
    Event(LinkEvent),
}

/// Messages consumed by the driver task
#[derive(Debug)]
enum Command {
    Received(Bytes),
    Sent(usize),
    Submit {
        channel: ChannelId,
        qualifier: bool,
        function: u8,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        channel: ChannelId,
        cause: Cause,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart(Cause),
    Stats(oneshot::Sender<LinkStats>),
    Shutdown,
}

/// Handle for talking to a running driver
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<Command>,
}

impl LinkHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::ChannelClosed)
    }

    /// Queues a frame on a session channel
    pub async fn submit(
        &self,
        channel: ChannelId,
        qualifier: bool,
        function: u8,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            channel,
            qualifier,
            function,
            data: data.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Resets one session channel
    pub async fn reset(&self, channel: ChannelId, cause: Cause) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { channel, cause, reply }).await?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Restarts the link
    pub async fn restart(&self, cause: Cause) -> Result<()> {
        self.send(Command::Restart(cause)).await
    }

    pub async fn stats(&self) -> Result<LinkStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Stops the driver task
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    /// Whether the driver has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn received(&self, bytes: Bytes) -> Result<()> {
        self.send(Command::Received(bytes)).await
    }

    pub(crate) async fn sent(&self, slot: usize) -> Result<()> {
        self.send(Command::Sent(slot)).await
    }

    /// For transport threads outside the runtime
    pub(crate) fn blocking_received(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .blocking_send(Command::Received(bytes))
            .map_err(|_| Error::ChannelClosed)
    }

    pub(crate) fn blocking_sent(&self, slot: usize) -> Result<()> {
        self.tx
            .blocking_send(Command::Sent(slot))
            .map_err(|_| Error::ChannelClosed)
    }
}

/// The other ends of a driver's queues
pub struct Endpoints {
    pub handle: LinkHandle,
    /// Delivered frames and link events
    pub notices: mpsc::Receiver<Notice>,
    /// Frames for the line writer
    pub outgoing: mpsc::Receiver<Outgoing>,
}

/// Single task owning the link engine
///
/// Line bytes, transmit completions, session commands and the three tick
/// sources all arrive as messages, so the engine is only ever touched from
/// this task.
pub struct LinkDriver {
    engine: LinkEngine,
    commands: mpsc::Receiver<Command>,
    outgoing: mpsc::Sender<Outgoing>,
    notices: mpsc::Sender<Notice>,
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl LinkDriver {
    /// Creates a driver and the queues that connect it to a transport
    pub fn new(config: LinkConfig) -> Result<(Self, Endpoints)> {
        let slots = config.tx_slots;
        let engine = LinkEngine::new(config)?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(slots);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE);

        let driver = LinkDriver {
            engine,
            commands: command_rx,
            outgoing: outgoing_tx,
            notices: notice_tx,
        };
        let endpoints = Endpoints {
            handle: LinkHandle { tx: command_tx },
            notices: notice_rx,
            outgoing: outgoing_rx,
        };
        Ok((driver, endpoints))
    }

    /// Runs until shut down or every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        let config = self.engine.config().clone();
        let mut coarse = ticker(config.coarse_tick);
        let mut medium = ticker(config.medium_tick);
        let mut fine = ticker(config.fine_tick);

        info!(role = ?config.role, window = config.window_size, "link driver started");
        self.engine.start();

        loop {
            self.flush_output()?;
            self.publish();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = coarse.tick() => self.engine.tick(Granularity::Coarse),
                _ = medium.tick() => self.engine.tick(Granularity::Medium),
                _ = fine.tick() => {
                    self.engine.tick(Granularity::Fine);
                    self.engine.poll_flow();
                }
            }
        }

        info!(stats = ?self.engine.stats(), "link driver stopped");
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Received(bytes) => {
                self.engine.receive_bytes(&bytes);
            }
            Command::Sent(slot) => {
                if let Err(e) = self.engine.transmit_complete(slot) {
                    warn!(slot, "transmit completion rejected: {}", e);
                }
            }
            Command::Submit { channel, qualifier, function, data, reply } => {
                let _ = reply.send(self.engine.submit(channel, qualifier, function, &data));
            }
            Command::Reset { channel, cause, reply } => {
                let _ = reply.send(self.engine.reset_channel(channel, cause));
            }
            Command::Restart(cause) => self.engine.restart(cause),
            Command::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
            Command::Shutdown => {}
        }
    }

    /// Moves staged frames to the line writer
    fn flush_output(&mut self) -> Result<()> {
        self.engine.poll_output()?;
        while let Some((slot, bytes)) = self.engine.take_transmit() {
            self.outgoing
                .try_send(Outgoing { slot, bytes })
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Passes events and delivered frames up while the notice queue has room
    ///
    /// Frames left undelivered stay in the engine and hold buflets, which
    /// turns a slow reader into RNR on the line.
    fn publish(&mut self) {
        while let Ok(permit) = self.notices.try_reserve() {
            let notice = loop {
                match self.engine.poll_event() {
                    Some(LinkEvent::FrameDelivered { .. }) => continue,
                    Some(event) => break Some(Notice::Event(event)),
                    None => break None,
                }
            };
            let notice = notice.or_else(|| {
                ChannelId::sessions()
                    .find_map(|id| self.engine.deliver(id))
                    .map(Notice::Frame)
            });
            match notice {
                Some(notice) => {
                    debug!(?notice, "notice");
                    permit.send(notice);
                }
                None => break,
            }
        }
    }
}
