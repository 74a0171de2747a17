//! Fixed-block memory pools.
//!
//! Two interchangeable implementations behind one trait: a slab pool that
//! reserves its byte budget up front and recycles blocks until closed, and
//! a heap pool that allocates per request and frees on final release.
//! Both count exactly `buffer_size` bytes per allocation and per final
//! release, and never exceed their byte budget.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use super::{Block, Buffer};
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

fn check_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size == 0 || !buffer_size.is_power_of_two() {
        return Err(Error::Config(format!(
            "buffer size must be a power of two, got {buffer_size}"
        )));
    }
    Ok(())
}

/// Allocator of fixed-size [`Buffer`]s under a hard byte budget.
pub trait BufferPool {
    /// Rent a cleared buffer.
    ///
    /// Fails with [`Error::PoolExhausted`] when the budget would be
    /// exceeded or the pool is closed.
    fn allocate(&mut self) -> Result<Buffer>;

    /// Return a buffer handle to the pool.
    ///
    /// Storage is reclaimed (and the byte counter decremented) only when
    /// this was the last live handle. Buffers from another pool are
    /// dropped with a logged warning.
    fn release(&mut self, buffer: Buffer);

    fn buffer_size(&self) -> usize;

    /// `log2(buffer_size)`.
    fn buffer_size_shift(&self) -> u32;

    /// Bytes currently rented out.
    fn used_bytes(&self) -> usize;

    /// The byte budget.
    fn capacity_bytes(&self) -> usize;

    /// Refuse further allocations and drop recycled storage.
    fn close(&mut self);
}

/// Pool that keeps ownership of its blocks for the lifetime of the pool.
///
/// Blocks are carved on first use, recycled LIFO, and only dropped at
/// `close`. This is the default ("direct") variant: after warm-up, the
/// allocation path never touches the allocator.
pub struct SlabBufferPool {
    id: u64,
    buffer_size: usize,
    shift: u32,
    capacity: usize,
    used: usize,
    free: Vec<Rc<RefCell<Block>>>,
    closed: bool,
}

impl SlabBufferPool {
    /// Fails with [`Error::Config`] when `buffer_size` is zero or not a
    /// power of two.
    pub fn new(capacity: usize, buffer_size: usize) -> Result<Self> {
        check_buffer_size(buffer_size)?;
        Ok(Self {
            id: next_pool_id(),
            buffer_size,
            shift: buffer_size.trailing_zeros(),
            capacity,
            used: 0,
            free: Vec::new(),
            closed: false,
        })
    }
}

impl BufferPool for SlabBufferPool {
    fn allocate(&mut self) -> Result<Buffer> {
        if self.closed || self.used + self.buffer_size > self.capacity {
            return Err(Error::PoolExhausted {
                used: self.used,
                capacity: self.capacity,
            });
        }
        let block = self
            .free
            .pop()
            .unwrap_or_else(|| Rc::new(RefCell::new(Block::new(self.buffer_size))));
        self.used += self.buffer_size;
        Ok(Buffer::new(block, self.id))
    }

    fn release(&mut self, buffer: Buffer) {
        if buffer.pool_id() != self.id {
            warn!(
                pool = self.id,
                foreign = buffer.pool_id(),
                "released buffer belongs to another pool, dropping"
            );
            return;
        }
        let block = buffer.into_block();
        if Rc::strong_count(&block) == 1 {
            self.used -= self.buffer_size;
            if !self.closed {
                let mut b = block.borrow_mut();
                b.read = 0;
                b.write = 0;
                drop(b);
                self.free.push(block);
            }
        }
        // Otherwise another stream still holds a share; accounting is
        // settled by the final release.
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn buffer_size_shift(&self) -> u32 {
        self.shift
    }

    fn used_bytes(&self) -> usize {
        self.used
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    fn close(&mut self) {
        self.closed = true;
        self.free.clear();
    }
}

/// Pool that allocates a fresh block per request and frees on final
/// release. Same contract and accounting as [`SlabBufferPool`].
pub struct HeapBufferPool {
    id: u64,
    buffer_size: usize,
    shift: u32,
    capacity: usize,
    used: usize,
    closed: bool,
}

impl HeapBufferPool {
    /// Fails with [`Error::Config`] when `buffer_size` is zero or not a
    /// power of two.
    pub fn new(capacity: usize, buffer_size: usize) -> Result<Self> {
        check_buffer_size(buffer_size)?;
        Ok(Self {
            id: next_pool_id(),
            buffer_size,
            shift: buffer_size.trailing_zeros(),
            capacity,
            used: 0,
            closed: false,
        })
    }
}

impl BufferPool for HeapBufferPool {
    fn allocate(&mut self) -> Result<Buffer> {
        if self.closed || self.used + self.buffer_size > self.capacity {
            return Err(Error::PoolExhausted {
                used: self.used,
                capacity: self.capacity,
            });
        }
        self.used += self.buffer_size;
        Ok(Buffer::new(
            Rc::new(RefCell::new(Block::new(self.buffer_size))),
            self.id,
        ))
    }

    fn release(&mut self, buffer: Buffer) {
        if buffer.pool_id() != self.id {
            warn!(
                pool = self.id,
                foreign = buffer.pool_id(),
                "released buffer belongs to another pool, dropping"
            );
            return;
        }
        let block = buffer.into_block();
        if Rc::strong_count(&block) == 1 {
            self.used -= self.buffer_size;
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn buffer_size_shift(&self) -> u32 {
        self.shift
    }

    fn used_bytes(&self) -> usize {
        self.used
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
