use std::collections::VecDeque;

use super::pool::{BufferPool, Chain, ChainId};

/// Anything that owns exactly one buffer chain
pub trait Chained {
    fn chain(&self) -> &Chain;

    fn into_chain(self) -> Chain;

    fn chain_id(&self) -> ChainId {
        self.chain().id()
    }
}

impl Chained for Chain {
    fn chain(&self) -> &Chain {
        self
    }

    fn into_chain(self) -> Chain {
        self
    }
}

/// FIFO of chain-owning entries
///
/// Append and pop are O(1); removing a specific entry is a linear scan.
#[derive(Debug)]
pub struct ChainQueue<T: Chained> {
    entries: VecDeque<T>,
}

impl<T: Chained> Default for ChainQueue<T> {
    fn default() -> Self {
        ChainQueue { entries: VecDeque::new() }
    }
}

impl<T: Chained> ChainQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, entry: T) {
        self.entries.push_back(entry);
    }

    /// Queues at the head; used to requeue frames for go-back-N
    pub fn push_front(&mut self, entry: T) {
        self.entries.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn pop_back(&mut self) -> Option<T> {
        self.entries.pop_back()
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut()
    }

    /// Pulls a specific queued entry out by chain identity
    pub fn remove(&mut self, id: ChainId) -> Option<T> {
        let pos = self.entries.iter().position(|e| e.chain_id() == id)?;
        self.entries.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Buflets held by every queued chain
    pub fn buflets(&self) -> usize {
        self.entries.iter().map(|e| e.chain().nodes()).sum()
    }

    /// Frees every queued chain back to the pool
    pub fn clear(&mut self, pool: &mut BufferPool) {
        while let Some(entry) = self.entries.pop_front() {
            pool.free(entry.into_chain());
        }
    }
}
