//! Tiered buffering: pooled memory blocks, a file-backed spill store, and
//! the composite streams that stitch both into one logical byte sequence.
//!
//! Memory is the fast tier. Each [`Buffer`] is a fixed-size block rented
//! from a [`BufferPool`]; when a session's output holds too many resident
//! blocks, further bytes spill into [`FileRegion`]s of the shared
//! [`FileStore`] and are drained back out in order.

mod input;
mod output;
mod pool;
mod store;

pub use input::{BufferInputStream, FillOutcome};
pub use output::{BufferOutputStream, DrainStatus};
pub use pool::{BufferPool, HeapBufferPool, SlabBufferPool};
pub use store::{FileRegion, FileStore};

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

/// Shared handle to a memory pool, held by the loop and by every stream.
pub type PoolRef = Rc<RefCell<dyn BufferPool>>;
/// Shared handle to the file store.
pub type StoreRef = Rc<RefCell<FileStore>>;

/// One element of a composite stream: a memory buffer or a spilled region.
#[derive(Debug)]
pub(crate) enum StreamElem {
    Mem(Buffer),
    File(FileRegion),
}

struct Block {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }
}

/// A fixed-size byte block rented from a [`BufferPool`].
///
/// Clones share the block and its indices; the strong count of the shared
/// handle is the buffer's reference count. The pool reclaims storage only
/// when the last clone is released back to it.
pub struct Buffer {
    block: Rc<RefCell<Block>>,
    pool_id: u64,
}

impl Buffer {
    pub(crate) fn new(block: Rc<RefCell<Block>>, pool_id: u64) -> Self {
        Self { block, pool_id }
    }

    pub(crate) fn into_block(self) -> Rc<RefCell<Block>> {
        self.block
    }

    /// Id of the pool this buffer was rented from.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Number of live handles to this block, including this one.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.block)
    }

    pub fn capacity(&self) -> usize {
        self.block.borrow().data.len()
    }

    /// Unread bytes: `write_index - read_index`.
    pub fn readable(&self) -> usize {
        let b = self.block.borrow();
        b.write - b.read
    }

    /// Remaining room: `capacity - write_index`.
    pub fn writable(&self) -> usize {
        let b = self.block.borrow();
        b.data.len() - b.write
    }

    pub fn read_index(&self) -> usize {
        self.block.borrow().read
    }

    pub fn write_index(&self) -> usize {
        self.block.borrow().write
    }

    /// Reset both indices, making the whole block writable again.
    pub fn clear(&self) {
        let mut b = self.block.borrow_mut();
        b.read = 0;
        b.write = 0;
    }

    /// Append from `src`, bounded by the remaining room.
    /// Returns the number of bytes copied in.
    pub fn write_from(&self, src: &[u8]) -> usize {
        let mut b = self.block.borrow_mut();
        let n = src.len().min(b.data.len() - b.write);
        let at = b.write;
        b.data[at..at + n].copy_from_slice(&src[..n]);
        b.write += n;
        n
    }

    /// Copy unread bytes into `dst`, advancing the read index.
    /// Returns the number of bytes copied out.
    pub fn read_into(&self, dst: &mut [u8]) -> usize {
        let mut b = self.block.borrow_mut();
        let n = dst.len().min(b.write - b.read);
        let at = b.read;
        dst[..n].copy_from_slice(&b.data[at..at + n]);
        b.read += n;
        n
    }

    /// Advance the read index without copying.
    pub fn skip(&self, n: usize) -> usize {
        let mut b = self.block.borrow_mut();
        let n = n.min(b.write - b.read);
        b.read += n;
        n
    }

    /// One non-blocking read from `io` into the remaining room.
    pub(crate) fn fill_from_io(&self, io: &mut impl Read) -> io::Result<usize> {
        let mut b = self.block.borrow_mut();
        let at = b.write;
        let n = io.read(&mut b.data[at..])?;
        b.write += n;
        Ok(n)
    }

    /// One non-blocking write of the unread bytes to `io`.
    pub(crate) fn drain_to_io(&self, io: &mut impl Write) -> io::Result<usize> {
        let mut b = self.block.borrow_mut();
        let (read, write) = (b.read, b.write);
        let n = io.write(&b.data[read..write])?;
        b.read += n;
        Ok(n)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self {
            block: Rc::clone(&self.block),
            pool_id: self.pool_id,
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.block.borrow();
        f.debug_struct("Buffer")
            .field("pool", &self.pool_id)
            .field("read", &b.read)
            .field("write", &b.write)
            .field("capacity", &b.data.len())
            .field("refs", &Rc::strong_count(&self.block))
            .finish()
    }
}
