use crate::dram::MemoryError;

// MMIO register *values* expected by a virtio-mmio driver.
pub const MAGIC_VALUE: u64 = 0x7472_6976; // "virt"
pub const VERSION: u64 = 2; // Modern (non-legacy) virtio-mmio
pub const VENDOR_ID: u64 = 0x554d_4551;

// Common MMIO register offsets
pub const MAGIC_VALUE_OFFSET: u64 = 0x000;
pub const VERSION_OFFSET: u64 = 0x004;
pub const DEVICE_ID_OFFSET: u64 = 0x008;
pub const VENDOR_ID_OFFSET: u64 = 0x00c;
pub const DEVICE_FEATURES_OFFSET: u64 = 0x010;
pub const DEVICE_FEATURES_SEL_OFFSET: u64 = 0x014;
pub const DRIVER_FEATURES_OFFSET: u64 = 0x020;
pub const DRIVER_FEATURES_SEL_OFFSET: u64 = 0x024;
pub const GUEST_PAGE_SIZE_OFFSET: u64 = 0x028;
pub const QUEUE_SEL_OFFSET: u64 = 0x030;
pub const QUEUE_NUM_MAX_OFFSET: u64 = 0x034;
pub const QUEUE_NUM_OFFSET: u64 = 0x038;
pub const QUEUE_PFN_OFFSET: u64 = 0x040;
pub const QUEUE_READY_OFFSET: u64 = 0x044;
pub const QUEUE_NOTIFY_OFFSET: u64 = 0x050;
pub const INTERRUPT_STATUS_OFFSET: u64 = 0x060;
pub const INTERRUPT_ACK_OFFSET: u64 = 0x064;
pub const STATUS_OFFSET: u64 = 0x070;
pub const QUEUE_DESC_LOW_OFFSET: u64 = 0x080;
pub const QUEUE_DESC_HIGH_OFFSET: u64 = 0x084;
pub const QUEUE_DRIVER_LOW_OFFSET: u64 = 0x090;
pub const QUEUE_DRIVER_HIGH_OFFSET: u64 = 0x094;
pub const QUEUE_DEVICE_LOW_OFFSET: u64 = 0x0a0;
pub const QUEUE_DEVICE_HIGH_OFFSET: u64 = 0x0a4;
pub const CONFIG_GENERATION_OFFSET: u64 = 0x0fc;
pub const CONFIG_SPACE_OFFSET: u64 = 0x100;

pub const VIRTIO_CONSOLE_DEVICE_ID: u32 = 3;

// Feature bits
pub const VIRTIO_CONSOLE_F_SIZE: u64 = 0;
pub const VIRTIO_CONSOLE_F_MULTIPORT: u64 = 1;
pub const VIRTIO_CONSOLE_F_EMERG_WRITE: u64 = 2;
pub const VIRTIO_F_VERSION_1: u64 = 32;

// Device status bits
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;

// Interrupt status bits
pub const INT_USED_BUFFER: u32 = 1;

pub const QUEUE_SIZE: u16 = 16;

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;

/// Trait for virtio-mmio devices.
///
/// Methods take `&self` so a device can be shared between the MMIO path and
/// host-side event sources. Implementations keep their state behind a mutex.
pub trait VirtioDevice: Send + Sync {
    fn read(&self, offset: u64) -> Result<u64, MemoryError>;
    fn write(&self, offset: u64, val: u64) -> Result<(), MemoryError>;
    fn is_interrupting(&self) -> bool;
    fn device_id(&self) -> u32;
    fn reg_read_size(&self, _offset: u64) -> u64 {
        // All registers, including the console config space, are read as 4-byte words.
        4
    }
}
