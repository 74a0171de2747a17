//! Writable view that appends to memory buffers and spills to the file
//! store under pressure.

use std::collections::VecDeque;
use std::io::{self, Write};

use super::{Buffer, PoolRef, StoreRef, StreamElem};
use crate::error::{Error, Result};

/// Outcome of one drain pass toward the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// The stream is empty; write interest can drop.
    Drained,
    /// Bytes remain; keep write interest asserted.
    Pending,
}

/// Ordered sequence of buffers and file regions, appended at the tail and
/// drained from the head.
///
/// Appends fill the tail memory buffer; once `max_write_buffers` memory
/// buffers are resident (or the pool is out of bytes), further appends go
/// into file regions. Draining consumes from the head regardless of
/// medium, releasing each element as it empties.
pub struct BufferOutputStream {
    elems: VecDeque<StreamElem>,
    pool: PoolRef,
    store: StoreRef,
    max_write_buffers: usize,
}

impl BufferOutputStream {
    pub(crate) fn new(pool: PoolRef, store: StoreRef, max_write_buffers: usize) -> Self {
        Self {
            elems: VecDeque::new(),
            pool,
            store,
            max_write_buffers,
        }
    }

    /// Total unread bytes queued toward the socket.
    pub fn len(&self) -> usize {
        self.elems
            .iter()
            .map(|e| match e {
                StreamElem::Mem(b) => b.readable(),
                StreamElem::File(r) => r.readable(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of memory buffers currently queued.
    pub fn resident_buffers(&self) -> usize {
        self.elems
            .iter()
            .filter(|e| matches!(e, StreamElem::Mem(_)))
            .count()
    }

    /// Append all of `src`, spilling to the file store past the resident
    /// buffer bound. File-store exhaustion is an error for the caller.
    pub fn append(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            // Top up the tail element first.
            let n = match self.elems.back_mut() {
                Some(StreamElem::Mem(b)) if b.writable() > 0 => b.write_from(src),
                Some(StreamElem::File(r)) if r.writable() > 0 => {
                    self.store.borrow_mut().write(r, src)?
                }
                _ => 0,
            };
            if n > 0 {
                src = &src[n..];
                continue;
            }
            self.push_tail_element()?;
        }
        Ok(())
    }

    /// Move an already-filled buffer onto the tail.
    ///
    /// Past the resident bound its bytes are copied into the spill tier
    /// instead and the buffer handle is released.
    pub fn append_buffer(&mut self, buffer: Buffer) -> Result<()> {
        if self.resident_buffers() < self.max_write_buffers {
            self.elems.push_back(StreamElem::Mem(buffer));
            return Ok(());
        }
        let mut chunk = [0u8; 512];
        loop {
            let n = buffer.read_into(&mut chunk);
            if n == 0 {
                break;
            }
            self.append(&chunk[..n])?;
        }
        self.pool.borrow_mut().release(buffer);
        Ok(())
    }

    /// Pick the medium for the next tail element and queue it, empty.
    fn push_tail_element(&mut self) -> Result<()> {
        if self.resident_buffers() < self.max_write_buffers {
            match self.pool.borrow_mut().allocate() {
                Ok(b) => {
                    self.elems.push_back(StreamElem::Mem(b));
                    return Ok(());
                }
                // Memory pressure spills to the file tier.
                Err(Error::PoolExhausted { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let region = self.store.borrow_mut().allocate()?;
        self.elems.push_back(StreamElem::File(region));
        Ok(())
    }

    /// Drain head elements into `io`, up to `spin` successful writes.
    ///
    /// A would-block, zero-length, or partial write ends the pass with
    /// [`DrainStatus::Pending`]. Returns the status and bytes written.
    pub fn drain_to(&mut self, io: &mut impl Write, spin: usize) -> Result<(DrainStatus, usize)> {
        let mut spins = 0;
        let mut total = 0;
        loop {
            let Some(head) = self.elems.front_mut() else {
                return Ok((DrainStatus::Drained, total));
            };
            let (readable, res) = match head {
                StreamElem::Mem(b) => (b.readable(), b.drain_to_io(io)),
                StreamElem::File(r) => (r.readable(), self.store.borrow_mut().transfer_to(r, io)),
            };
            if readable == 0 {
                self.release_front();
                continue;
            }
            match res {
                Ok(0) => return Ok((DrainStatus::Pending, total)),
                Ok(n) => {
                    total += n;
                    spins += 1;
                    if n == readable {
                        self.release_front();
                    } else {
                        // Partial write: the socket buffer is full enough.
                        return Ok((DrainStatus::Pending, total));
                    }
                    if self.elems.is_empty() {
                        return Ok((DrainStatus::Drained, total));
                    }
                    if spins >= spin {
                        return Ok((DrainStatus::Pending, total));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((DrainStatus::Pending, total));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
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

    /// Hand the queued elements over to an input stream, in order.
    #[cfg(test)]
    pub(crate) fn drain_into_input(&mut self, input: &mut super::BufferInputStream) {
        while let Some(elem) = self.elems.pop_front() {
            match elem {
                StreamElem::Mem(b) => input.push_buffer(b),
                StreamElem::File(r) => input.push_region(r),
            }
        }
    }
}
