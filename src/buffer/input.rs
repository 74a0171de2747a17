//! Readable view over a queue of buffers and spilled regions.

use std::collections::VecDeque;
use std::io::{self, Read};

use super::{Buffer, FileRegion, PoolRef, StoreRef, StreamElem};
use crate::error::Result;

/// Outcome of one socket fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Bytes were appended to the stream.
    Read(usize),
    /// The socket had nothing ready.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

/// Ordered sequence of stream elements consumed from the head.
///
/// Fully drained elements are released back to their pool or store in
/// order. The resident memory-buffer count drives read backpressure.
pub struct BufferInputStream {
    elems: VecDeque<StreamElem>,
    pool: PoolRef,
    store: StoreRef,
}

impl BufferInputStream {
    pub(crate) fn new(pool: PoolRef, store: StoreRef) -> Self {
        Self {
            elems: VecDeque::new(),
            pool,
            store,
        }
    }

    /// Total unread bytes across all queued elements.
    pub fn available(&self) -> usize {
        self.elems
            .iter()
            .map(|e| match e {
                StreamElem::Mem(b) => b.readable(),
                StreamElem::File(r) => r.readable(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Number of memory buffers currently queued.
    pub fn resident_buffers(&self) -> usize {
        self.elems
            .iter()
            .filter(|e| matches!(e, StreamElem::Mem(_)))
            .count()
    }

    pub(crate) fn push_buffer(&mut self, buffer: Buffer) {
        self.elems.push_back(StreamElem::Mem(buffer));
    }

    pub(crate) fn push_region(&mut self, region: FileRegion) {
        self.elems.push_back(StreamElem::File(region));
    }

    /// Copy up to `dst.len()` bytes from the head, releasing elements as
    /// they drain. Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(head) = self.elems.front_mut() else {
                break;
            };
            let n = match head {
                StreamElem::Mem(b) => b.read_into(&mut dst[copied..]),
                StreamElem::File(r) => self.store.borrow_mut().read(r, &mut dst[copied..])?,
            };
            copied += n;
            let drained = match head {
                StreamElem::Mem(b) => b.readable() == 0,
                StreamElem::File(r) => r.readable() == 0,
            };
            if drained {
                self.release_front();
            } else if n == 0 {
                break;
            }
        }
        Ok(copied)
    }

    /// Discard up to `n` bytes from the head. Returns the number skipped.
    pub fn skip(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n {
            let Some(head) = self.elems.front_mut() else {
                break;
            };
            let (got, drained) = match head {
                StreamElem::Mem(b) => (b.skip(n - skipped), b.readable() == 0),
                StreamElem::File(r) => {
                    // File bytes are read through so the store accounting
                    // stays exact.
                    let mut scratch = [0u8; 512];
                    let want = (n - skipped).min(scratch.len());
                    let got = self.store.borrow_mut().read(r, &mut scratch[..want])?;
                    (got, r.readable() == 0)
                }
            };
            if drained {
                self.release_front();
            } else if got == 0 {
                break;
            }
            skipped += got;
        }
        Ok(skipped)
    }

    /// One non-blocking read from `io` into the tail buffer, renting a new
    /// one when the tail is full or absent.
    pub(crate) fn fill_from(&mut self, io: &mut impl Read) -> Result<FillOutcome> {
        // Reuse tail room when present; otherwise rent a fresh buffer that
        // is only queued once it actually receives bytes.
        let (buf, fresh) = match self.elems.back() {
            Some(StreamElem::Mem(b)) if b.writable() > 0 => (b.clone(), false),
            _ => (self.pool.borrow_mut().allocate()?, true),
        };
        let res = loop {
            match buf.fill_from_io(io) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match res {
            Ok(0) => {
                if fresh {
                    self.pool.borrow_mut().release(buf);
                }
                Ok(FillOutcome::Eof)
            }
            Ok(n) => {
                if fresh {
                    self.elems.push_back(StreamElem::Mem(buf));
                }
                Ok(FillOutcome::Read(n))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if fresh {
                    self.pool.borrow_mut().release(buf);
                }
                Ok(FillOutcome::WouldBlock)
            }
            Err(e) => {
                if fresh {
                    self.pool.borrow_mut().release(buf);
                }
                Err(e.into())
            }
        }
    }

    fn release_front(&mut self) {
        match self.elems.pop_front() {
            Some(StreamElem::Mem(b)) => self.pool.borrow_mut().release(b),
            Some(StreamElem::File(r)) => self.store.borrow_mut().release(r),
            None => {}
        }
    }

    /// Release every element back to its pool or store.
    pub(crate) fn release_all(&mut self) {
        while !self.elems.is_empty() {
            self.release_front();
        }
    }
}
