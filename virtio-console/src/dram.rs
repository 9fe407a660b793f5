use std::sync::Mutex;
use thiserror::Error;

/// Base guest physical address of emulated RAM.
///
/// Virtqueue rings and buffers handed to the console device must live at or
/// above this address.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Guest memory access errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Emulated guest RAM.
///
/// All accessors take **guest physical addresses**; the translation to a
/// local offset happens here so devices never do their own `DRAM_BASE`
/// arithmetic. Scalar accesses are little-endian and must be naturally
/// aligned, matching what a virtio driver is allowed to place in a ring.
///
/// The backing store sits behind a mutex so the device (driven by MMIO
/// writes) and host-side bus callbacks can touch rings from different
/// threads.
pub struct Dram {
    pub base: u64,
    size: usize,
    data: Mutex<Vec<u8>>,
}

impl Dram {
    /// Create a new zero-initialised region of `size` bytes mapped at `base`.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            size,
            data: Mutex::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Translate a guest physical range into a local offset, checking bounds.
    fn offset(&self, addr: u64, len: usize) -> Result<usize, MemoryError> {
        let off = addr
            .checked_sub(self.base)
            .ok_or(MemoryError::OutOfBounds(addr))? as usize;
        match off.checked_add(len) {
            Some(end) if end <= self.size => Ok(off),
            _ => Err(MemoryError::OutOfBounds(addr)),
        }
    }

    fn aligned(addr: u64, width: u64) -> Result<(), MemoryError> {
        if addr % width != 0 {
            return Err(MemoryError::InvalidAlignment(addr));
        }
        Ok(())
    }

    fn load<const N: usize>(&self, addr: u64) -> Result<[u8; N], MemoryError> {
        Self::aligned(addr, N as u64)?;
        let off = self.offset(addr, N)?;
        let data = self.data.lock().unwrap();
        let mut out = [0u8; N];
        out.copy_from_slice(&data[off..off + N]);
        Ok(out)
    }

    fn store<const N: usize>(&self, addr: u64, bytes: [u8; N]) -> Result<(), MemoryError> {
        Self::aligned(addr, N as u64)?;
        let off = self.offset(addr, N)?;
        let mut data = self.data.lock().unwrap();
        data[off..off + N].copy_from_slice(&bytes);
        Ok(())
    }

    // ========== READ METHODS ==========

    pub fn load_8(&self, addr: u64) -> Result<u8, MemoryError> {
        Ok(self.load::<1>(addr)?[0])
    }

    pub fn load_16(&self, addr: u64) -> Result<u16, MemoryError> {
        Ok(u16::from_le_bytes(self.load(addr)?))
    }

    pub fn load_32(&self, addr: u64) -> Result<u32, MemoryError> {
        Ok(u32::from_le_bytes(self.load(addr)?))
    }

    pub fn load_64(&self, addr: u64) -> Result<u64, MemoryError> {
        Ok(u64::from_le_bytes(self.load(addr)?))
    }

    /// Copy `len` bytes starting at `addr` out of guest memory.
    pub fn read_range(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let off = self.offset(addr, len)?;
        let data = self.data.lock().unwrap();
        Ok(data[off..off + len].to_vec())
    }

    // ========== WRITE METHODS ==========

    pub fn store_8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.store(addr, [value])
    }

    pub fn store_16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.store(addr, value.to_le_bytes())
    }

    pub fn store_32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.store(addr, value.to_le_bytes())
    }

    pub fn store_64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.store(addr, value.to_le_bytes())
    }

    /// Copy `bytes` into guest memory at `addr`.
    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let off = self.offset(addr, bytes.len())?;
        let mut data = self.data.lock().unwrap();
        data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`.
    pub fn zero_range(&self, addr: u64, len: usize) -> Result<(), MemoryError> {
        let off = self.offset(addr, len)?;
        let mut data = self.data.lock().unwrap();
        data[off..off + len].fill(0);
        Ok(())
    }
}
