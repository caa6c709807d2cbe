//! Buffer management
//!
//! Every frame the link holds lives in a chain of fixed-size buflets carved
//! from one preallocated arena. Chains move between queues by value, so a
//! chain has exactly one owner at any time.

pub mod pool;
pub mod queue;

pub use self::pool::{BufferPool, Chain, ChainId};
pub use self::queue::{ChainQueue, Chained};
