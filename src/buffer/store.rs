//! File-backed region store for write spill-over.
//!
//! One temporary file, carved into fixed-size regions addressed by id:
//! region `id` occupies file bytes `[id * region_size, (id + 1) * region_size)`.
//! Released regions re-enter a free list, except the highest-numbered one,
//! whose release truncates the file so its length stays at
//! `max_id * region_size`. The file is deleted when the store is dropped.

use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

const TRANSFER_CHUNK: usize = 8 * 1024;

/// A fixed-size logical slice of the store's backing file.
#[derive(Debug)]
pub struct FileRegion {
    id: u32,
    capacity: usize,
    read: usize,
    write: usize,
}

impl FileRegion {
    fn new(id: u32, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            read: 0,
            write: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Unread bytes within the region.
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Remaining room within the region.
    pub fn writable(&self) -> usize {
        self.capacity - self.write
    }
}

/// Region allocator over a single temporary file, capped at a byte budget.
pub struct FileStore {
    file: NamedTempFile,
    region_size: usize,
    capacity: u64,
    max_id: u32,
    free: Vec<u32>,
    /// Sum of `write - read` over live regions.
    size: u64,
    closed: bool,
}

impl FileStore {
    /// Create the backing file in the system temp directory.
    pub fn new(capacity: u64, region_size: usize) -> Result<Self> {
        let file = NamedTempFile::new()?;
        debug!(path = %file.path().display(), capacity, region_size, "file store created");
        Ok(Self {
            file,
            region_size,
            capacity,
            max_id: 0,
            free: Vec::new(),
            size: 0,
            closed: false,
        })
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Sum of unread bytes over live regions.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// Current length of the backing file.
    pub fn file_len(&self) -> io::Result<u64> {
        Ok(self.file.as_file().metadata()?.len())
    }

    fn offset(&self, region: &FileRegion, index: usize) -> u64 {
        region.id as u64 * self.region_size as u64 + index as u64
    }

    /// Hand out an unused region, reusing the free list before extending
    /// the file.
    pub fn allocate(&mut self) -> Result<FileRegion> {
        if self.closed {
            return Err(Error::StoreExhausted {
                used: self.size,
                capacity: self.capacity,
            });
        }
        if let Some(id) = self.free.pop() {
            return Ok(FileRegion::new(id, self.region_size));
        }
        let next_len = (self.max_id as u64 + 1) * self.region_size as u64;
        if next_len > self.capacity {
            return Err(Error::StoreExhausted {
                used: self.size,
                capacity: self.capacity,
            });
        }
        let id = self.max_id;
        self.max_id += 1;
        self.file.as_file().set_len(next_len)?;
        Ok(FileRegion::new(id, self.region_size))
    }

    /// Return a region. The highest-numbered region shrinks the file
    /// (best effort); any other re-enters the free list, its file bytes
    /// lingering until the top frees.
    pub fn release(&mut self, region: FileRegion) {
        self.size = self.size.saturating_sub(region.readable() as u64);
        if self.closed {
            return;
        }
        if region.id + 1 == self.max_id {
            self.max_id -= 1;
            // Free-listed regions that are now on top shrink with it.
            while self.max_id > 0 {
                match self.free.iter().position(|&id| id + 1 == self.max_id) {
                    Some(at) => {
                        self.free.swap_remove(at);
                        self.max_id -= 1;
                    }
                    None => break,
                }
            }
            let len = self.max_id as u64 * self.region_size as u64;
            if let Err(e) = self.file.as_file().set_len(len) {
                debug!(error = %e, "file store truncation failed, ignoring");
            }
        } else {
            self.free.push(region.id);
        }
    }

    /// Append from `src` into the region, bounded by its remaining room.
    pub fn write(&mut self, region: &mut FileRegion, src: &[u8]) -> Result<usize> {
        let n = src.len().min(region.writable());
        if n == 0 {
            return Ok(0);
        }
        let off = self.offset(region, region.write);
        self.file.as_file().write_all_at(&src[..n], off)?;
        region.write += n;
        self.size += n as u64;
        Ok(n)
    }

    /// Copy unread region bytes into `dst`, advancing the read index.
    /// A short read means the backing file was truncated underneath us.
    pub fn read(&mut self, region: &mut FileRegion, dst: &mut [u8]) -> Result<usize> {
        let n = dst.len().min(region.readable());
        if n == 0 {
            return Ok(0);
        }
        let off = self.offset(region, region.read);
        self.file
            .as_file()
            .read_exact_at(&mut dst[..n], off)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file store truncated",
                    ))
                } else {
                    Error::Io(e)
                }
            })?;
        region.read += n;
        self.size -= n as u64;
        Ok(n)
    }

    /// One bounded copy from `input` (typically a socket) into the region.
    pub fn transfer_from(
        &mut self,
        region: &mut FileRegion,
        input: &mut impl Read,
    ) -> io::Result<usize> {
        let mut tmp = [0u8; TRANSFER_CHUNK];
        let want = region.writable().min(tmp.len());
        if want == 0 {
            return Ok(0);
        }
        let n = input.read(&mut tmp[..want])?;
        if n == 0 {
            return Ok(0);
        }
        let off = self.offset(region, region.write);
        self.file.as_file().write_all_at(&tmp[..n], off)?;
        region.write += n;
        self.size += n as u64;
        Ok(n)
    }

    /// One bounded copy from the region out to `out` (typically a socket).
    /// Advances the read index by what `out` actually accepted.
    pub fn transfer_to(
        &mut self,
        region: &mut FileRegion,
        out: &mut impl Write,
    ) -> io::Result<usize> {
        let mut tmp = [0u8; TRANSFER_CHUNK];
        let want = region.readable().min(tmp.len());
        if want == 0 {
            return Ok(0);
        }
        let off = self.offset(region, region.read);
        self.file.as_file().read_exact_at(&mut tmp[..want], off)?;
        let written = out.write(&tmp[..want])?;
        region.read += written;
        self.size -= written as u64;
        Ok(written)
    }

    /// Refuse further allocations. The backing file is deleted on drop.
    pub fn close(&mut self) {
        self.closed = true;
        self.free.clear();
        self.max_id = 0;
        self.size = 0;
        if let Err(e) = self.file.as_file().set_len(0) {
            debug!(error = %e, "file store truncation failed, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: u64, region_size: usize) -> FileStore {
        FileStore::new(capacity, region_size).unwrap()
    }

    #[test]
    fn test_file_length_tracks_max_id() {
        let mut s = store(4096, 1024);
        let a = s.allocate().unwrap();
        let b = s.allocate().unwrap();
        let c = s.allocate().unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
        assert_eq!(s.file_len().unwrap(), 3 * 1024);

        // Top release truncates.
        s.release(c);
        assert_eq!(s.max_id(), 2);
        assert_eq!(s.file_len().unwrap(), 2 * 1024);

        // Intermediate release does not.
        s.release(a);
        assert_eq!(s.max_id(), 2);
        assert_eq!(s.file_len().unwrap(), 2 * 1024);

        // The freed slot is reused before the file grows again.
        let again = s.allocate().unwrap();
        assert_eq!(again.id(), 0);
        assert_eq!(s.file_len().unwrap(), 2 * 1024);

        // Releasing the top region pulls free-listed ones down with it.
        s.release(again);
        s.release(b);
        assert_eq!(s.max_id(), 0);
        assert_eq!(s.file_len().unwrap(), 0);
    }

    #[test]
    fn test_region_write_read_roundtrip() {
        let mut s = store(4096, 1024);
        let mut a = s.allocate().unwrap();
        let mut b = s.allocate().unwrap();

        assert_eq!(s.write(&mut a, b"alpha").unwrap(), 5);
        assert_eq!(s.write(&mut b, b"bravo").unwrap(), 5);
        assert_eq!(s.size(), 10);

        let mut out = [0u8; 5];
        assert_eq!(s.read(&mut b, &mut out).unwrap(), 5);
        assert_eq!(&out, b"bravo");
        assert_eq!(s.read(&mut a, &mut out).unwrap(), 5);
        assert_eq!(&out, b"alpha");
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_write_bounded_by_region_room() {
        let mut s = store(4096, 8);
        let mut r = s.allocate().unwrap();
        assert_eq!(s.write(&mut r, b"0123456789").unwrap(), 8);
        assert_eq!(r.writable(), 0);
        assert_eq!(s.write(&mut r, b"x").unwrap(), 0);
    }

    #[test]
    fn test_store_exhaustion() {
        let mut s = store(2048, 1024);
        let _a = s.allocate().unwrap();
        let _b = s.allocate().unwrap();
        assert!(matches!(
            s.allocate(),
            Err(Error::StoreExhausted { capacity: 2048, .. })
        ));
    }

    #[test]
    fn test_short_read_is_truncated_error() {
        let mut s = store(4096, 1024);
        let mut r = s.allocate().unwrap();
        s.write(&mut r, b"data").unwrap();

        // Shrink the file underneath the region.
        s.file.as_file().set_len(0).unwrap();

        let mut out = [0u8; 4];
        match s.read(&mut r, &mut out) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected truncated error, got {other:?}"),
        }
    }

    #[test]
    fn test_transfer_from_reader() {
        let mut s = store(4096, 16);
        let mut r = s.allocate().unwrap();

        let mut src: &[u8] = b"0123456789abcdefgh";
        assert_eq!(s.transfer_from(&mut r, &mut src).unwrap(), 16);
        assert_eq!(r.writable(), 0);
        assert_eq!(s.size(), 16);
        // Region full: nothing more is pulled.
        assert_eq!(s.transfer_from(&mut r, &mut src).unwrap(), 0);

        let mut out = [0u8; 16];
        s.read(&mut r, &mut out).unwrap();
        assert_eq!(&out, b"0123456789abcdef");
    }

    #[test]
    fn test_transfer_to_writer() {
        let mut s = store(4096, 1024);
        let mut r = s.allocate().unwrap();
        s.write(&mut r, b"spilled bytes").unwrap();

        let mut sink = Vec::new();
        let n = s.transfer_to(&mut r, &mut sink).unwrap();
        assert_eq!(n, 13);
        assert_eq!(sink, b"spilled bytes");
        assert_eq!(r.readable(), 0);
        assert_eq!(s.size(), 0);
    }
}
