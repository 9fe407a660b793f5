pub mod console;
pub mod device;
pub mod queue;

// Re-export common types for convenience
pub use console::{ConsoleError, DeviceConfig, VirtioConsole};
pub use device::VirtioDevice;
pub use queue::{BufferChain, SplitQueue, Virtqueue};
