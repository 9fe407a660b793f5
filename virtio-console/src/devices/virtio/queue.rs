//! Virtqueue transport used by the console device.
//!
//! The console core only needs the small contract in [`Virtqueue`] and
//! [`BufferChain`]: count pending requests, pop one, read or write its
//! payload, and hand it back. [`SplitQueue`] implements that contract over a
//! virtio 1.x split ring living in guest memory.
//!
//! ## Split ring layout
//!
//! - Descriptor table: `num` entries of 16 bytes (`addr u64, len u32, flags u16, next u16`)
//! - Available ring (driver → device): `flags u16, idx u16, ring[num] u16`
//! - Used ring (device → driver): `flags u16, idx u16, ring[num] {id u32, len u32}`

use std::sync::Arc;

use thiserror::Error;

use super::device::{VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use crate::dram::{Dram, MemoryError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no pending request on the queue")]
    Empty,

    #[error("descriptor index {0} is outside the descriptor table")]
    BadDescriptor(u16),

    #[error("descriptor chain starting at {0} loops or exceeds the ring size")]
    ChainLoop(u16),

    #[error("descriptor chain starting at {0} lies outside guest memory")]
    BadAddress(u16),

    #[error("available index ran {0} entries ahead, more than the ring holds")]
    AvailOverrun(u16),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A guest-supplied scatter-gather buffer taken from one ring slot.
///
/// A chain must be handed back through [`Virtqueue::push_reply`] exactly
/// once; the number of bytes written into it is reported to the driver.
pub trait BufferChain {
    /// Total bytes in the device-readable part of the chain.
    fn readable_length(&self) -> usize;

    /// Total bytes in the device-writable part of the chain.
    fn writable_length(&self) -> usize;

    /// Copy the readable payload into `dest`, returning the number of bytes copied.
    fn read_blob(&self, dest: &mut [u8]) -> Result<usize, QueueError>;

    /// Append `src` to the writable part, returning how much fit.
    fn write_blob(&mut self, src: &[u8]) -> Result<usize, QueueError>;

    /// Bytes written so far.
    fn written(&self) -> u32;
}

pub trait Virtqueue {
    type Chain: BufferChain;

    /// Ring slot count.
    fn capacity(&self) -> u16;

    /// Requests posted by the driver and not yet popped by the device.
    fn pending_count(&self) -> u16;

    fn has_pending_request(&self) -> bool {
        self.pending_count() > 0
    }

    fn pop_request(&mut self) -> Result<Self::Chain, QueueError>;

    /// Stage `chain` as completed. Nothing is visible to the driver until
    /// [`Virtqueue::flush_replies`].
    fn push_reply(&mut self, chain: Self::Chain);

    /// Publish staged replies. Returns `true` if anything was published.
    fn flush_replies(&mut self) -> Result<bool, QueueError>;
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    addr: u64,
    len: u32,
}

/// Buffer chain backed by descriptors in guest memory.
pub struct DescriptorChain {
    mem: Arc<Dram>,
    head: u16,
    readable: Vec<Segment>,
    writable: Vec<Segment>,
    written: u32,
}

impl DescriptorChain {
    pub fn head(&self) -> u16 {
        self.head
    }
}

impl BufferChain for DescriptorChain {
    fn readable_length(&self) -> usize {
        self.readable.iter().map(|s| s.len as usize).sum()
    }

    fn writable_length(&self) -> usize {
        self.writable.iter().map(|s| s.len as usize).sum()
    }

    fn read_blob(&self, dest: &mut [u8]) -> Result<usize, QueueError> {
        let mut copied = 0;
        for seg in &self.readable {
            if copied == dest.len() {
                break;
            }
            let n = (seg.len as usize).min(dest.len() - copied);
            let bytes = self.mem.read_range(seg.addr, n)?;
            dest[copied..copied + n].copy_from_slice(&bytes);
            copied += n;
        }
        Ok(copied)
    }

    fn write_blob(&mut self, src: &[u8]) -> Result<usize, QueueError> {
        let mut skip = self.written as usize;
        let mut copied = 0;
        for seg in &self.writable {
            if copied == src.len() {
                break;
            }
            let seg_len = seg.len as usize;
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let n = (seg_len - skip).min(src.len() - copied);
            self.mem
                .write_bytes(seg.addr + skip as u64, &src[copied..copied + n])?;
            copied += n;
            skip = 0;
        }
        self.written += copied as u32;
        Ok(copied)
    }

    fn written(&self) -> u32 {
        self.written
    }
}

/// Split virtqueue in guest memory.
///
/// Ring addresses and size are programmed by the driver through the MMIO
/// front-end; the device side only tracks its own progress through the
/// available ring and a shadow of the used index.
pub struct SplitQueue {
    mem: Arc<Dram>,
    max_size: u16,
    pub(crate) num: u16,
    pub(crate) desc: u64,
    pub(crate) avail: u64,
    pub(crate) used: u64,
    pub(crate) ready: bool,
    last_avail_idx: u16,
    used_idx: u16,
    staged: Vec<(u16, u32)>,
}

impl SplitQueue {
    pub fn new(mem: Arc<Dram>, max_size: u16) -> Self {
        Self {
            mem,
            max_size,
            num: 0,
            desc: 0,
            avail: 0,
            used: 0,
            ready: false,
            last_avail_idx: 0,
            used_idx: 0,
            staged: Vec::new(),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Forget all ring state (device reset).
    pub fn reset(&mut self) {
        self.num = 0;
        self.desc = 0;
        self.avail = 0;
        self.used = 0;
        self.ready = false;
        self.last_avail_idx = 0;
        self.used_idx = 0;
        self.staged.clear();
    }

    /// Legacy queue setup: the whole ring lives in one page-aligned region.
    pub fn set_pfn(&mut self, pfn: u32, page_size: u32) {
        if pfn == 0 {
            self.ready = false;
            return;
        }
        let page = page_size as u64;
        let num = self.capacity() as u64;
        self.desc = pfn as u64 * page;
        self.avail = self.desc + 16 * num;
        // Avail ring size: flags(2) + idx(2) + ring(2*n) + used_event(2) = 6 + 2*n
        let avail_size = 6 + 2 * num;
        self.used = (self.avail + avail_size + page - 1) & !(page - 1);
        self.ready = true;
    }

    fn avail_idx(&self) -> Result<u16, MemoryError> {
        self.mem.load_16(self.avail.wrapping_add(2))
    }

    /// Entries the driver claims to have posted, unclamped.
    fn posted(&self) -> u16 {
        if !self.ready {
            return 0;
        }
        match self.avail_idx() {
            Ok(avail_idx) => avail_idx.wrapping_sub(self.last_avail_idx),
            Err(e) => {
                log::error!("[SplitQueue] Failed to read avail index: {}", e);
                0
            }
        }
    }

    fn load_desc(&self, desc_addr: u64) -> Result<(u64, u32, u16, u16), MemoryError> {
        Ok((
            self.mem.load_64(desc_addr)?,
            self.mem.load_32(desc_addr + 8)?,
            self.mem.load_16(desc_addr + 12)?,
            self.mem.load_16(desc_addr + 14)?,
        ))
    }

    fn walk_chain(&self, head: u16) -> Result<DescriptorChain, QueueError> {
        let num = self.capacity();
        let mut chain = DescriptorChain {
            mem: Arc::clone(&self.mem),
            head,
            readable: Vec::new(),
            writable: Vec::new(),
            written: 0,
        };

        let mut idx = head;
        for _ in 0..num {
            if idx >= num {
                return Err(QueueError::BadDescriptor(idx));
            }
            let desc_addr = self.desc.wrapping_add(idx as u64 * 16);
            let (addr, len, flags, next) = self
                .load_desc(desc_addr)
                .map_err(|_| QueueError::BadAddress(head))?;

            let seg = Segment { addr, len };
            if flags & VRING_DESC_F_WRITE != 0 {
                chain.writable.push(seg);
            } else {
                chain.readable.push(seg);
            }

            if flags & VRING_DESC_F_NEXT == 0 {
                return Ok(chain);
            }
            idx = next;
        }
        Err(QueueError::ChainLoop(head))
    }
}

impl Virtqueue for SplitQueue {
    type Chain = DescriptorChain;

    fn capacity(&self) -> u16 {
        if self.num > 0 { self.num } else { self.max_size }
    }

    fn pending_count(&self) -> u16 {
        self.posted().min(self.capacity())
    }

    fn pop_request(&mut self) -> Result<DescriptorChain, QueueError> {
        let posted = self.posted();
        if posted == 0 {
            return Err(QueueError::Empty);
        }
        if posted > self.capacity() {
            // Nothing in the ring can be trusted; skip to the driver's index.
            self.last_avail_idx = self.last_avail_idx.wrapping_add(posted);
            log::warn!("[SplitQueue] Available index {} entries ahead, resynchronised", posted);
            return Err(QueueError::AvailOverrun(posted));
        }
        let ring_slot = (self.last_avail_idx % self.capacity()) as u64;
        let head = self
            .mem
            .load_16(self.avail.wrapping_add(4).wrapping_add(ring_slot * 2))?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        match self.walk_chain(head) {
            Ok(chain) => Ok(chain),
            Err(e) => {
                // Hand the slot back empty so a malformed chain does not leak it.
                log::warn!("[SplitQueue] Dropping malformed chain at head {}: {}", head, e);
                self.staged.push((head, 0));
                Err(e)
            }
        }
    }

    fn push_reply(&mut self, chain: DescriptorChain) {
        self.staged.push((chain.head, chain.written));
    }

    fn flush_replies(&mut self) -> Result<bool, QueueError> {
        if self.staged.is_empty() {
            return Ok(false);
        }
        let num = self.capacity() as u64;
        for (head, len) in self.staged.drain(..) {
            let elem_addr = self
                .used
                .wrapping_add(4)
                .wrapping_add((self.used_idx as u64 % num) * 8);
            self.mem.store_32(elem_addr, head as u32)?;
            self.mem.store_32(elem_addr + 4, len)?;
            self.used_idx = self.used_idx.wrapping_add(1);
        }
        self.mem.store_16(self.used.wrapping_add(2), self.used_idx)?;
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::dram::DRAM_BASE;

    const DESC: u64 = DRAM_BASE;
    const AVAIL: u64 = DRAM_BASE + 0x100;
    const USED: u64 = DRAM_BASE + 0x200;
    const BUFS: u64 = DRAM_BASE + 0x1000;

    fn queue(num: u16) -> (Arc<Dram>, SplitQueue) {
        let mem = Arc::new(Dram::new(DRAM_BASE, 0x4000));
        let mut q = SplitQueue::new(Arc::clone(&mem), 16);
        q.num = num;
        q.desc = DESC;
        q.avail = AVAIL;
        q.used = USED;
        q.ready = true;
        (mem, q)
    }

    fn set_desc(mem: &Dram, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let d = DESC + idx as u64 * 16;
        mem.store_64(d, addr).unwrap();
        mem.store_32(d + 8, len).unwrap();
        mem.store_16(d + 12, flags).unwrap();
        mem.store_16(d + 14, next).unwrap();
    }

    fn make_avail(mem: &Dram, heads: &[u16]) {
        let mut idx = mem.load_16(AVAIL + 2).unwrap();
        for &h in heads {
            mem.store_16(AVAIL + 4 + (idx % 8) as u64 * 2, h).unwrap();
            idx = idx.wrapping_add(1);
        }
        mem.store_16(AVAIL + 2, idx).unwrap();
    }

    #[test]
    fn test_pop_reads_chained_payload() {
        let (mem, mut q) = queue(8);
        mem.write_bytes(BUFS, b"hel").unwrap();
        mem.write_bytes(BUFS + 0x100, b"lo").unwrap();
        set_desc(&mem, 0, BUFS, 3, VRING_DESC_F_NEXT, 1);
        set_desc(&mem, 1, BUFS + 0x100, 2, 0, 0);
        make_avail(&mem, &[0]);

        assert_eq!(q.pending_count(), 1);
        let chain = q.pop_request().unwrap();
        assert_eq!(chain.readable_length(), 5);
        let mut buf = vec![0; chain.readable_length()];
        chain.read_blob(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        assert!(!q.has_pending_request());
        assert_eq!(q.pop_request().err(), Some(QueueError::Empty));
    }

    #[test]
    fn test_write_spans_segments_and_reports_length() {
        let (mem, mut q) = queue(8);
        set_desc(&mem, 3, BUFS, 2, VRING_DESC_F_WRITE | VRING_DESC_F_NEXT, 4);
        set_desc(&mem, 4, BUFS + 0x100, 4, VRING_DESC_F_WRITE, 0);
        make_avail(&mem, &[3]);

        let mut chain = q.pop_request().unwrap();
        assert_eq!(chain.writable_length(), 6);
        assert_eq!(chain.write_blob(b"abcdefgh").unwrap(), 6);
        q.push_reply(chain);
        assert!(q.flush_replies().unwrap());

        assert_eq!(mem.read_range(BUFS, 2).unwrap(), b"ab");
        assert_eq!(mem.read_range(BUFS + 0x100, 4).unwrap(), b"cdef");
        assert_eq!(mem.load_16(USED + 2).unwrap(), 1);
        assert_eq!(mem.load_32(USED + 4).unwrap(), 3);
        assert_eq!(mem.load_32(USED + 8).unwrap(), 6);
    }

    #[test]
    fn test_flush_without_replies_is_noop() {
        let (mem, mut q) = queue(8);
        assert!(!q.flush_replies().unwrap());
        assert_eq!(mem.load_16(USED + 2).unwrap(), 0);
    }

    #[test]
    fn test_looping_chain_is_returned_empty() {
        let (mem, mut q) = queue(4);
        set_desc(&mem, 0, BUFS, 1, VRING_DESC_F_NEXT, 1);
        set_desc(&mem, 1, BUFS, 1, VRING_DESC_F_NEXT, 0);
        make_avail(&mem, &[0]);

        assert_eq!(q.pop_request().err(), Some(QueueError::ChainLoop(0)));
        assert!(q.flush_replies().unwrap());
        assert_eq!(mem.load_16(USED + 2).unwrap(), 1);
        assert_eq!(mem.load_32(USED + 8).unwrap(), 0);
    }

    #[test]
    fn test_chain_outside_memory_is_returned_empty() {
        let (mem, mut q) = queue(8);
        set_desc(&mem, 0, BUFS, 4, VRING_DESC_F_NEXT, 1);
        make_avail(&mem, &[0]);
        q.desc = DRAM_BASE + 0x3ff8;

        assert_eq!(q.pop_request().err(), Some(QueueError::BadAddress(0)));
        assert!(q.flush_replies().unwrap());
        assert_eq!(mem.load_32(USED + 8).unwrap(), 0);
    }

    #[test]
    fn test_runaway_avail_index_is_clamped() {
        let (mem, mut q) = queue(8);
        mem.store_16(AVAIL + 2, 1000).unwrap();

        assert_eq!(q.pending_count(), 8);
        assert_eq!(q.pop_request().err(), Some(QueueError::AvailOverrun(1000)));
        assert_eq!(q.pending_count(), 0);
        assert!(!q.flush_replies().unwrap());
        assert_eq!(mem.load_16(USED + 2).unwrap(), 0);
    }

    #[test]
    fn test_not_ready_queue_has_nothing_pending() {
        let (mem, mut q) = queue(8);
        set_desc(&mem, 0, BUFS, 1, 0, 0);
        make_avail(&mem, &[0]);
        q.reset();
        assert_eq!(q.pending_count(), 0);
        assert_eq!(q.capacity(), 16);
    }

    #[test]
    fn test_legacy_pfn_layout() {
        let mem = Arc::new(Dram::new(DRAM_BASE, 0x4000));
        let mut q = SplitQueue::new(mem, 16);
        q.set_pfn((DRAM_BASE / 4096) as u32 + 1, 4096);
        assert!(q.is_ready());
        assert_eq!(q.desc, DRAM_BASE + 4096);
        assert_eq!(q.avail, DRAM_BASE + 4096 + 256);
        assert_eq!(q.used, DRAM_BASE + 2 * 4096);
    }
}
