//! VirtIO multiport console device.
//!
//! The device bridges guest virtqueues to a host byte bus: guest output is
//! published per port, host input and window resizes are delivered to the
//! guest, and a small control protocol announces and opens ports.

pub mod devices;
pub mod dram;
pub mod guest;
pub mod host_bus;

#[cfg(not(target_arch = "wasm32"))]
pub mod terminal;

pub use devices::virtio::console::{ConsoleError, ConsoleStats, DeviceConfig, VirtioConsole};
pub use dram::{Dram, MemoryError, DRAM_BASE};
pub use host_bus::{HostBus, SubscriptionId};
