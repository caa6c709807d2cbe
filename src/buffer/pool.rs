use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::core::{Error, Result};

/// Identity of an allocated chain (its head buflet index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(u16);

/// Exclusive handle to a run of linked buflets holding one frame
///
/// A chain is deliberately neither `Clone` nor `Copy`: it has exactly one
/// owner and is given back to the pool by value with [`BufferPool::free`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "chains must be returned to the pool with BufferPool::free"]
pub struct Chain {
    head: u16,
    nodes: usize,
    len: usize,
}

impl Chain {
    pub fn id(&self) -> ChainId {
        ChainId(self.head)
    }

    /// Bytes written into the chain
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buflets in the chain
    pub fn nodes(&self) -> usize {
        self.nodes
    }
}

/// Fixed arena of buflets with a linked free list
pub struct BufferPool {
    buflet_size: usize,
    arena: Vec<u8>,
    links: Vec<Option<u16>>,
    free_head: Option<u16>,
    free_count: usize,
}

impl BufferPool {
    /// Carves the arena into `pool_size` buflets, all initially free
    pub fn new(pool_size: usize, buflet_size: usize) -> Result<Self> {
        if pool_size == 0 || pool_size > u16::MAX as usize {
            return Err(Error::buffer(format!("pool size out of range: {}", pool_size)));
        }
        if buflet_size == 0 {
            return Err(Error::buffer("buflet size must be non-zero"));
        }

        let links = (0..pool_size)
            .map(|i| if i + 1 < pool_size { Some((i + 1) as u16) } else { None })
            .collect();

        Ok(BufferPool {
            buflet_size,
            arena: vec![0; pool_size * buflet_size],
            links,
            free_head: Some(0),
            free_count: pool_size,
        })
    }

    /// Total number of buflets
    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    pub fn buflet_size(&self) -> usize {
        self.buflet_size
    }

    /// Buflets currently on the free list
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Buflets needed to hold `len` bytes
    pub fn buflets_for(&self, len: usize) -> usize {
        len.div_ceil(self.buflet_size).max(1)
    }

    /// Takes exactly `n` buflets off the free list, or nothing at all
    pub fn alloc(&mut self, n: usize) -> Option<Chain> {
        if n == 0 || n > self.free_count {
            return None;
        }

        let head = self.free_head?;
        let mut tail = head;
        for _ in 1..n {
            tail = self.links[tail as usize]?;
        }
        self.free_head = self.links[tail as usize].take();
        self.free_count -= n;
        trace!(head, n, free = self.free_count, "allocated chain");

        Some(Chain { head, nodes: n, len: 0 })
    }

    /// Allocates a chain and fills it with `bytes`
    pub fn alloc_with(&mut self, bytes: &[u8]) -> Option<Chain> {
        let mut chain = self.alloc(self.buflets_for(bytes.len()))?;
        if self.write(&mut chain, bytes).is_err() {
            self.free(chain);
            return None;
        }
        Some(chain)
    }

    /// Walks the chain and links all of it back onto the free list
    pub fn free(&mut self, chain: Chain) {
        let mut count = 1;
        let mut tail = chain.head;
        while let Some(next) = self.links[tail as usize] {
            tail = next;
            count += 1;
        }
        debug_assert_eq!(count, chain.nodes, "chain length drifted from its handle");

        self.links[tail as usize] = self.free_head;
        self.free_head = Some(chain.head);
        self.free_count += count;
        trace!(head = chain.head, count, free = self.free_count, "freed chain");
    }

    /// Counts the free list by walking it
    pub fn walk_free(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.links[idx as usize];
        }
        count
    }

    /// Overwrites the chain contents from offset 0
    pub fn write(&mut self, chain: &mut Chain, bytes: &[u8]) -> Result<()> {
        if bytes.len() > chain.nodes * self.buflet_size {
            return Err(Error::buffer(format!(
                "{} bytes do not fit in {} buflets",
                bytes.len(),
                chain.nodes
            )));
        }

        let mut node = Some(chain.head);
        for piece in bytes.chunks(self.buflet_size) {
            let idx = match node {
                Some(idx) => idx as usize,
                None => break,
            };
            let start = idx * self.buflet_size;
            self.arena[start..start + piece.len()].copy_from_slice(piece);
            node = self.links[idx];
        }
        chain.len = bytes.len();
        Ok(())
    }

    /// Reads one byte of the chain
    pub fn byte_at(&self, chain: &Chain, offset: usize) -> Option<u8> {
        if offset >= chain.len {
            return None;
        }
        let (idx, within) = self.locate(chain, offset)?;
        Some(self.arena[idx * self.buflet_size + within])
    }

    /// Overwrites one byte of the chain in place
    pub fn set_byte(&mut self, chain: &Chain, offset: usize, value: u8) -> Result<()> {
        if offset >= chain.len {
            return Err(Error::buffer(format!("offset {} beyond chain length {}", offset, chain.len)));
        }
        let (idx, within) = self
            .locate(chain, offset)
            .ok_or_else(|| Error::buffer("chain shorter than its handle"))?;
        self.arena[idx * self.buflet_size + within] = value;
        Ok(())
    }

    /// Copies the chain contents into contiguous bytes
    pub fn to_bytes(&self, chain: &Chain) -> Bytes {
        let mut out = BytesMut::with_capacity(chain.len);
        let mut remaining = chain.len;
        let mut node = Some(chain.head);
        while remaining > 0 {
            let idx = match node {
                Some(idx) => idx as usize,
                None => break,
            };
            let take = remaining.min(self.buflet_size);
            let start = idx * self.buflet_size;
            out.put_slice(&self.arena[start..start + take]);
            remaining -= take;
            node = self.links[idx];
        }
        out.freeze()
    }

    fn locate(&self, chain: &Chain, offset: usize) -> Option<(usize, usize)> {
        let mut idx = chain.head;
        for _ in 0..offset / self.buflet_size {
            idx = self.links[idx as usize]?;
        }
        Some((idx as usize, offset % self.buflet_size))
    }
}
