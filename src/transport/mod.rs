//! Transport module
//!
//! Connects a [`LinkEngine`](crate::link::LinkEngine) to a real line. The
//! engine lives inside a single driver task; readers, writers and the
//! session layer reach it only through message queues.

pub mod driver;
pub mod serial;
pub mod stream;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::Result;

pub use self::driver::{Endpoints, LinkDriver, LinkHandle, Notice, Outgoing};

/// A running link
pub struct Link {
    /// Session-side control of the link
    pub handle: LinkHandle,
    /// Delivered frames and link events
    pub notices: mpsc::Receiver<Notice>,
    /// The driver task
    pub task: JoinHandle<Result<()>>,
}
