//! Simulated guest driver.
//!
//! Plays the guest side of a virtio console over MMIO and guest memory: it
//! negotiates the device, lays out one split ring per queue and moves bytes
//! through fixed per-descriptor buffers. The command-line harness uses it as
//! a stand-in guest and the device tests use it to drive real rings.

use std::sync::Arc;

use thiserror::Error;

use crate::devices::virtio::console::control::{ControlError, ControlMessage, ControlPacket};
use crate::devices::virtio::device::{self, VirtioDevice};
use crate::dram::{Dram, MemoryError};

/// Size of the buffer behind every descriptor.
pub const BUFFER_SIZE: u64 = 256;

const PAGE_SIZE: u64 = 4096;
const CONTROL_RX: usize = 2;
const CONTROL_TX: usize = 3;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("not a virtio console: {0}")]
    NotConsole(String),

    #[error("device rejected features (status {0:#x})")]
    FeaturesRejected(u32),

    #[error("guest memory exhausted laying out queue {0}")]
    OutOfMemory(u32),

    #[error("no free descriptor on queue {0}")]
    QueueFull(u32),

    #[error("port {0} does not exist")]
    NoSuchPort(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

struct DriverQueue {
    index: u32,
    num: u16,
    desc: u64,
    avail: u64,
    used: u64,
    buffers: u64,
    free: Vec<u16>,
    avail_idx: u16,
    last_used: u16,
    completions: Vec<u32>,
}

impl DriverQueue {
    fn buffer(&self, desc: u16) -> u64 {
        self.buffers + desc as u64 * BUFFER_SIZE
    }
}

pub struct GuestDriver {
    device: Arc<dyn VirtioDevice>,
    mem: Arc<Dram>,
    queues: Vec<DriverQueue>,
    port_count: u32,
    features: u64,
}

impl GuestDriver {
    /// Reset and negotiate `device`, then bring every queue up and post
    /// control receive buffers.
    pub fn attach(device: Arc<dyn VirtioDevice>, mem: Arc<Dram>) -> Result<Self, GuestError> {
        let magic = device.read(device::MAGIC_VALUE_OFFSET)?;
        if magic != device::MAGIC_VALUE {
            return Err(GuestError::NotConsole(format!("bad magic {:#x}", magic)));
        }
        let id = device.read(device::DEVICE_ID_OFFSET)? as u32;
        if id != device::VIRTIO_CONSOLE_DEVICE_ID {
            return Err(GuestError::NotConsole(format!("device id {}", id)));
        }

        device.write(device::STATUS_OFFSET, 0)?;
        let mut status = device::STATUS_ACKNOWLEDGE | device::STATUS_DRIVER;
        device.write(device::STATUS_OFFSET, status as u64)?;

        let mut features = 0u64;
        for sel in 0..2u64 {
            device.write(device::DEVICE_FEATURES_SEL_OFFSET, sel)?;
            features |= device.read(device::DEVICE_FEATURES_OFFSET)? << (32 * sel);
        }
        for sel in 0..2u64 {
            device.write(device::DRIVER_FEATURES_SEL_OFFSET, sel)?;
            device.write(device::DRIVER_FEATURES_OFFSET, (features >> (32 * sel)) & 0xffff_ffff)?;
        }
        status |= device::STATUS_FEATURES_OK;
        device.write(device::STATUS_OFFSET, status as u64)?;
        let readback = device.read(device::STATUS_OFFSET)? as u32;
        if readback & device::STATUS_FEATURES_OK == 0 {
            return Err(GuestError::FeaturesRejected(readback));
        }

        let port_count = if features & (1 << device::VIRTIO_CONSOLE_F_MULTIPORT) != 0 {
            device.read(device::CONFIG_SPACE_OFFSET + 4)? as u32
        } else {
            1
        };

        let mut driver = Self {
            device,
            mem,
            queues: Vec::new(),
            port_count,
            features,
        };
        let mut next = driver.mem.base;
        for index in 0..2 * port_count + 2 {
            let queue = driver.setup_queue(index, &mut next)?;
            driver.queues.push(queue);
        }

        status |= device::STATUS_DRIVER_OK;
        driver.device.write(device::STATUS_OFFSET, status as u64)?;

        let control_buffers = driver.queues[CONTROL_RX].num.saturating_sub(3) as usize;
        driver.post_writable(CONTROL_RX, control_buffers)?;
        driver.notify(CONTROL_RX)?;

        log::debug!(
            "[GuestDriver] Attached: {} port(s), features {:#x}",
            port_count,
            features
        );
        Ok(driver)
    }

    fn setup_queue(&self, index: u32, next: &mut u64) -> Result<DriverQueue, GuestError> {
        self.device.write(device::QUEUE_SEL_OFFSET, index as u64)?;
        let num = self.device.read(device::QUEUE_NUM_MAX_OFFSET)? as u16;
        if num == 0 {
            return Err(GuestError::NotConsole(format!("queue {} unavailable", index)));
        }

        let n = num as u64;
        let desc = *next;
        let avail = desc + 16 * n;
        let used = (avail + 6 + 2 * n + 3) & !3;
        let buffers = (used + 6 + 8 * n + 15) & !15;
        let end = (buffers + n * BUFFER_SIZE + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if end > self.mem.base + self.mem.size() as u64 {
            return Err(GuestError::OutOfMemory(index));
        }
        *next = end;
        self.mem.zero_range(desc, (end - desc) as usize)?;

        self.device.write(device::QUEUE_NUM_OFFSET, n)?;
        self.device.write(device::QUEUE_DESC_LOW_OFFSET, desc & 0xffff_ffff)?;
        self.device.write(device::QUEUE_DESC_HIGH_OFFSET, desc >> 32)?;
        self.device.write(device::QUEUE_DRIVER_LOW_OFFSET, avail & 0xffff_ffff)?;
        self.device.write(device::QUEUE_DRIVER_HIGH_OFFSET, avail >> 32)?;
        self.device.write(device::QUEUE_DEVICE_LOW_OFFSET, used & 0xffff_ffff)?;
        self.device.write(device::QUEUE_DEVICE_HIGH_OFFSET, used >> 32)?;
        self.device.write(device::QUEUE_READY_OFFSET, 1)?;

        Ok(DriverQueue {
            index,
            num,
            desc,
            avail,
            used,
            buffers,
            free: (0..num).rev().collect(),
            avail_idx: 0,
            last_used: 0,
            completions: Vec::new(),
        })
    }

    pub fn port_count(&self) -> u32 {
        self.port_count
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ring plumbing
    // ═══════════════════════════════════════════════════════════════════════

    fn write_desc(&self, q: usize, idx: u16, len: u32, flags: u16, next: u16) -> Result<(), GuestError> {
        let queue = &self.queues[q];
        let d = queue.desc + idx as u64 * 16;
        self.mem.store_64(d, queue.buffer(idx))?;
        self.mem.store_32(d + 8, len)?;
        self.mem.store_16(d + 12, flags)?;
        self.mem.store_16(d + 14, next)?;
        Ok(())
    }

    fn make_available(&mut self, q: usize, head: u16) -> Result<(), GuestError> {
        let queue = &mut self.queues[q];
        let slot = (queue.avail_idx % queue.num) as u64;
        self.mem.store_16(queue.avail + 4 + slot * 2, head)?;
        queue.avail_idx = queue.avail_idx.wrapping_add(1);
        self.mem.store_16(queue.avail + 2, queue.avail_idx)?;
        Ok(())
    }

    fn alloc(&mut self, q: usize) -> Result<u16, GuestError> {
        let queue = &mut self.queues[q];
        queue.free.pop().ok_or(GuestError::QueueFull(queue.index))
    }

    /// Post `count` empty device-writable buffers.
    fn post_writable(&mut self, q: usize, count: usize) -> Result<(), GuestError> {
        for _ in 0..count {
            let idx = self.alloc(q)?;
            self.write_desc(q, idx, BUFFER_SIZE as u32, device::VRING_DESC_F_WRITE, 0)?;
            self.make_available(q, idx)?;
        }
        Ok(())
    }

    /// Post `bytes` as one device-readable chain, split across descriptors.
    fn post_readable(&mut self, q: usize, bytes: &[u8]) -> Result<(), GuestError> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes]
        } else {
            bytes.chunks(BUFFER_SIZE as usize).collect()
        };
        if chunks.len() > self.queues[q].free.len() {
            return Err(GuestError::QueueFull(self.queues[q].index));
        }
        let descs: Vec<u16> = (0..chunks.len())
            .map(|_| self.alloc(q))
            .collect::<Result<_, _>>()?;
        for (i, chunk) in chunks.iter().enumerate() {
            let idx = descs[i];
            self.mem.write_bytes(self.queues[q].buffer(idx), chunk)?;
            let (flags, next) = match descs.get(i + 1) {
                Some(&next) => (device::VRING_DESC_F_NEXT, next),
                None => (0, 0),
            };
            self.write_desc(q, idx, chunk.len() as u32, flags, next)?;
        }
        self.make_available(q, descs[0])
    }

    fn notify(&self, q: usize) -> Result<(), GuestError> {
        self.device
            .write(device::QUEUE_NOTIFY_OFFSET, self.queues[q].index as u64)?;
        Ok(())
    }

    /// Collect used entries, returning each head with the bytes the device
    /// wrote into it and releasing its descriptors.
    fn reclaim(&mut self, q: usize) -> Result<Vec<(u32, Vec<u8>)>, GuestError> {
        let used_idx = self.mem.load_16(self.queues[q].used + 2)?;
        let mut out = Vec::new();
        let queue = &mut self.queues[q];
        while queue.last_used != used_idx {
            let slot = (queue.last_used % queue.num) as u64;
            let elem = queue.used + 4 + slot * 8;
            let head = self.mem.load_32(elem)? as u16;
            let len = self.mem.load_32(elem + 4)?;
            let data = self
                .mem
                .read_range(queue.buffer(head), (len as u64).min(BUFFER_SIZE) as usize)?;

            let mut idx = head;
            loop {
                let d = queue.desc + idx as u64 * 16;
                let flags = self.mem.load_16(d + 12)?;
                let next = self.mem.load_16(d + 14)?;
                queue.free.push(idx);
                if flags & device::VRING_DESC_F_NEXT == 0 {
                    break;
                }
                idx = next;
            }
            queue.last_used = queue.last_used.wrapping_add(1);
            out.push((len, data));
        }
        Ok(out)
    }

    fn port_queues(&self, port: u32) -> Result<(usize, usize), GuestError> {
        match port {
            0 => Ok((0, 1)),
            p if p < self.port_count => Ok((2 * p as usize + 2, 2 * p as usize + 3)),
            p => Err(GuestError::NoSuchPort(p)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control queue
    // ═══════════════════════════════════════════════════════════════════════

    pub fn send_control(&mut self, msg: ControlMessage) -> Result<(), GuestError> {
        log::debug!("[GuestDriver] Sending {}", msg);
        let acks = self.reclaim(CONTROL_TX)?;
        self.queues[CONTROL_TX]
            .completions
            .extend(acks.into_iter().map(|(len, _)| len));
        self.post_readable(CONTROL_TX, &msg.encode())?;
        self.notify(CONTROL_TX)
    }

    /// Number of control messages the device has returned since the last call.
    pub fn control_acks(&mut self) -> Result<usize, GuestError> {
        let acks = self.reclaim(CONTROL_TX)?;
        let queue = &mut self.queues[CONTROL_TX];
        Ok(std::mem::take(&mut queue.completions).len() + acks.len())
    }

    /// Parse every control message the device delivered and repost the
    /// buffers they arrived in.
    pub fn recv_control(&mut self) -> Result<Vec<ControlPacket>, GuestError> {
        let used = self.reclaim(CONTROL_RX)?;
        let mut packets = Vec::new();
        for (_, data) in &used {
            if data.is_empty() {
                continue;
            }
            packets.push(ControlPacket::parse(data)?);
        }
        if !used.is_empty() {
            self.post_writable(CONTROL_RX, used.len())?;
            self.notify(CONTROL_RX)?;
        }
        Ok(packets)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ports
    // ═══════════════════════════════════════════════════════════════════════

    pub fn write_port(&mut self, port: u32, bytes: &[u8]) -> Result<(), GuestError> {
        let (_, tx) = self.port_queues(port)?;
        let acks = self.reclaim(tx)?;
        self.queues[tx]
            .completions
            .extend(acks.into_iter().map(|(len, _)| len));
        self.post_readable(tx, bytes)?;
        self.notify(tx)
    }

    /// Used lengths of transmit buffers the device has returned.
    pub fn transmit_acks(&mut self, port: u32) -> Result<Vec<u32>, GuestError> {
        let (_, tx) = self.port_queues(port)?;
        let acks = self.reclaim(tx)?;
        let queue = &mut self.queues[tx];
        let mut lens = std::mem::take(&mut queue.completions);
        lens.extend(acks.into_iter().map(|(len, _)| len));
        Ok(lens)
    }

    pub fn post_receive_buffers(&mut self, port: u32, count: usize) -> Result<(), GuestError> {
        let (rx, _) = self.port_queues(port)?;
        self.post_writable(rx, count)?;
        self.notify(rx)
    }

    /// Bytes the device delivered to `port`, in order.
    pub fn read_port(&mut self, port: u32) -> Result<Vec<u8>, GuestError> {
        let (rx, _) = self.port_queues(port)?;
        Ok(self
            .reclaim(rx)?
            .into_iter()
            .flat_map(|(_, data)| data)
            .collect())
    }

    /// Receive buffers posted on `port` that the device has not returned.
    pub fn pending_on(&self, port: u32) -> Result<u16, GuestError> {
        let (rx, _) = self.port_queues(port)?;
        let queue = &self.queues[rx];
        let used_idx = self.mem.load_16(queue.used + 2)?;
        Ok(queue.avail_idx.wrapping_sub(used_idx))
    }

    /// Post receive buffers until `target` are outstanding on `port`.
    pub fn top_up_receive(&mut self, port: u32, target: u16) -> Result<(), GuestError> {
        let pending = self.pending_on(port)?;
        if pending < target {
            self.post_receive_buffers(port, (target - pending) as usize)?;
        }
        Ok(())
    }

    /// Acknowledge a pending interrupt, returning the status that was set.
    pub fn ack_interrupt(&self) -> Result<u32, GuestError> {
        let status = self.device.read(device::INTERRUPT_STATUS_OFFSET)?;
        if status != 0 {
            self.device.write(device::INTERRUPT_ACK_OFFSET, status)?;
        }
        Ok(status as u32)
    }
}
