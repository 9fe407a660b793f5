//! VirtIO Console Device Implementation (Device ID 3)
//!
//! Multiport serial console bridging guest virtqueues to the host byte bus.
//!
//! ## Queues
//!
//! - Queue 0/1: port 0 receive / transmit
//! - Queue 2/3: control receive (device → driver) / control transmit (driver → device)
//! - Queue 2p+2 / 2p+3: port p receive / transmit, for p >= 1
//!
//! ## Host bus channels
//!
//! For a device named `<dev>` and port `p`:
//! - `<dev>-output-bytes-<p>`: bytes the guest wrote
//! - `<dev>-input-bytes-<p>`: bytes to deliver to the guest
//! - `<dev>-resize-<p>`: `[rows u16][cols u16]` little-endian
//!
//! ## Config space
//!
//! `cols u16 @0x00`, `rows u16 @0x02`, `max_nr_ports u32 @0x04`, `emerg_wr u32 @0x08`

pub mod config;
pub mod control;
pub mod engine;
pub mod router;

use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

pub use self::config::DeviceConfig;
pub use self::control::{ControlError, ControlEvent, ControlMessage, ControlPacket, ControlPayload};
pub use self::engine::{ConsoleCore, ConsoleStats, ControlPhase, Effects, PortState, WindowSize};
pub use self::router::{QueueHandler, QueueLayout, QueueRole};

use super::device::{self, VirtioDevice};
use super::queue::{QueueError, SplitQueue};
use crate::dram::{Dram, MemoryError};
use crate::host_bus::{HostBus, SubscriptionId};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no queue with index {0}")]
    UnknownQueue(u32),

    #[error("port {0} does not exist")]
    PortOutOfRange(u32),

    #[error("driver sent device-only event {event:?} for port {port}")]
    UnexpectedEvent { event: ControlEvent, port: u32 },

    #[error("no buffer posted on queue {0}")]
    NoBuffer(u32),

    #[error("emergency write of {0:#x}")]
    EmergencyWrite(u32),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

const CONFIG_EMERG_WR: u64 = device::CONFIG_SPACE_OFFSET + 8;
const CONFIG_SPACE_LEN: usize = 12;

const DEVICE_FEATURES: u64 = (1 << device::VIRTIO_CONSOLE_F_SIZE)
    | (1 << device::VIRTIO_CONSOLE_F_MULTIPORT)
    | (1 << device::VIRTIO_CONSOLE_F_EMERG_WRITE)
    | (1 << device::VIRTIO_F_VERSION_1);

pub fn output_channel(device: &str, port: u32) -> String {
    format!("{}-output-bytes-{}", device, port)
}

pub fn input_channel(device: &str, port: u32) -> String {
    format!("{}-input-bytes-{}", device, port)
}

pub fn resize_channel(device: &str, port: u32) -> String {
    format!("{}-resize-{}", device, port)
}

/// Bytes to publish on a resize channel.
pub fn resize_payload(rows: u16, cols: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    out[0..2].copy_from_slice(&rows.to_le_bytes());
    out[2..4].copy_from_slice(&cols.to_le_bytes());
    out
}

fn parse_resize(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < 4 {
        return None;
    }
    Some((
        u16::from_le_bytes([bytes[0], bytes[1]]),
        u16::from_le_bytes([bytes[2], bytes[3]]),
    ))
}

fn set_low(addr: &mut u64, val: u32) {
    *addr = (*addr & 0xffff_ffff_0000_0000) | val as u64;
}

fn set_high(addr: &mut u64, val: u32) {
    *addr = (*addr & 0x0000_0000_ffff_ffff) | ((val as u64) << 32);
}

/// Internal mutable state for VirtioConsole, protected by Mutex
struct VirtioConsoleState {
    driver_features: [u32; 2],
    driver_features_sel: u32,
    device_features_sel: u32,
    page_size: u32,
    queue_sel: u32,
    interrupt_status: u32,
    status: u32,
    core: ConsoleCore<SplitQueue>,
}

impl VirtioConsoleState {
    /// Raise the used-buffer interrupt if needed, returning output to publish.
    fn absorb(&mut self, effects: Effects) -> Vec<(u32, Vec<u8>)> {
        if effects.interrupt {
            self.interrupt_status |= device::INT_USED_BUFFER;
        }
        effects.output
    }

    fn config_space(&self) -> [u8; CONFIG_SPACE_LEN] {
        let window = self.core.window();
        let mut cfg = [0u8; CONFIG_SPACE_LEN];
        cfg[0..2].copy_from_slice(&window.cols.to_le_bytes());
        cfg[2..4].copy_from_slice(&window.rows.to_le_bytes());
        cfg[4..8].copy_from_slice(&self.core.config().port_count.to_le_bytes());
        cfg
    }

    fn reset(&mut self) {
        self.status = 0;
        self.interrupt_status = 0;
        self.driver_features = [0; 2];
        self.queue_sel = 0;
        for index in 0..self.core.layout().queue_count() {
            if let Some(queue) = self.core.queue_mut(index) {
                queue.reset();
            }
        }
        self.core.reset_protocol();
    }
}

/// VirtIO multiport console device.
///
/// Guest notifications arrive through [`VirtioDevice::write`]; host input and
/// resizes arrive through the [`HostBus`] channels the device subscribes to at
/// construction. Guest output is published on the bus after the device lock
/// is released.
pub struct VirtioConsole {
    name: String,
    bus: Arc<HostBus>,
    state: Mutex<VirtioConsoleState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl VirtioConsole {
    pub fn new(
        config: DeviceConfig,
        mem: Arc<Dram>,
        bus: Arc<HostBus>,
    ) -> Result<Arc<Self>, ConsoleError> {
        config.validate()?;
        let queues = (0..config.queue_count())
            .map(|_| SplitQueue::new(Arc::clone(&mem), config.queue_size))
            .collect();
        let name = config.name.clone();
        let port_count = config.port_count;
        let core = ConsoleCore::new(config, queues)?;

        let console = Arc::new(Self {
            name,
            bus: Arc::clone(&bus),
            state: Mutex::new(VirtioConsoleState {
                driver_features: [0; 2],
                driver_features_sel: 0,
                device_features_sel: 0,
                page_size: 4096,
                queue_sel: 0,
                interrupt_status: 0,
                status: 0,
                core,
            }),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut ids = Vec::with_capacity(2 * port_count as usize);
        for port in 0..port_count {
            let weak: Weak<Self> = Arc::downgrade(&console);
            ids.push(bus.subscribe(&input_channel(&console.name, port), move |bytes| {
                if let Some(console) = weak.upgrade() {
                    console.inject_input(port, bytes);
                }
            }));

            let weak: Weak<Self> = Arc::downgrade(&console);
            ids.push(bus.subscribe(&resize_channel(&console.name, port), move |bytes| {
                let Some(console) = weak.upgrade() else {
                    return;
                };
                match parse_resize(bytes) {
                    Some((rows, cols)) => console.resize(port, rows, cols),
                    None => log::warn!(
                        "[VirtioConsole] Ignoring {} byte resize payload for port {}",
                        bytes.len(),
                        port
                    ),
                }
            }));
        }
        *console.subscriptions.lock().unwrap() = ids;

        log::debug!(
            "[VirtioConsole] '{}' created with {} port(s)",
            console.name,
            port_count
        );
        Ok(console)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_channel(&self, port: u32) -> String {
        output_channel(&self.name, port)
    }

    pub fn input_channel(&self, port: u32) -> String {
        input_channel(&self.name, port)
    }

    pub fn resize_channel(&self, port: u32) -> String {
        resize_channel(&self.name, port)
    }

    /// Deliver host bytes to `port`, dropping what does not fit.
    pub fn inject_input(&self, port: u32, bytes: &[u8]) {
        let output = {
            let mut state = self.state.lock().unwrap();
            let effects = state.core.deliver_input(port, bytes);
            state.absorb(effects)
        };
        self.publish(output);
    }

    /// Host window size changed for `port`.
    pub fn resize(&self, port: u32, rows: u16, cols: u16) {
        let output = {
            let mut state = self.state.lock().unwrap();
            let effects = state.core.resize(port, rows, cols);
            state.absorb(effects)
        };
        self.publish(output);
    }

    pub fn stats(&self) -> ConsoleStats {
        self.state.lock().unwrap().core.stats().clone()
    }

    pub fn port_state(&self, port: u32) -> Option<PortState> {
        self.state.lock().unwrap().core.port_state(port)
    }

    pub fn phase(&self) -> ControlPhase {
        self.state.lock().unwrap().core.phase()
    }

    pub fn window(&self) -> WindowSize {
        self.state.lock().unwrap().core.window()
    }

    pub fn port_count(&self) -> u32 {
        self.state.lock().unwrap().core.config().port_count
    }

    fn publish(&self, output: Vec<(u32, Vec<u8>)>) {
        for (port, bytes) in output {
            self.bus.publish(&self.output_channel(port), &bytes);
        }
    }
}

impl Drop for VirtioConsole {
    fn drop(&mut self) {
        let ids = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        for id in ids {
            self.bus.unsubscribe(id);
        }
    }
}

impl VirtioDevice for VirtioConsole {
    fn device_id(&self) -> u32 {
        device::VIRTIO_CONSOLE_DEVICE_ID
    }

    fn is_interrupting(&self) -> bool {
        self.state.lock().unwrap().interrupt_status != 0
    }

    fn read(&self, offset: u64) -> Result<u64, MemoryError> {
        let state = self.state.lock().unwrap();
        let queue = state.core.queue(state.queue_sel);

        let val = match offset {
            device::MAGIC_VALUE_OFFSET => device::MAGIC_VALUE,
            device::VERSION_OFFSET => device::VERSION,
            device::DEVICE_ID_OFFSET => device::VIRTIO_CONSOLE_DEVICE_ID as u64,
            device::VENDOR_ID_OFFSET => device::VENDOR_ID,
            device::DEVICE_FEATURES_OFFSET => match state.device_features_sel {
                0 => DEVICE_FEATURES & 0xffff_ffff,
                1 => DEVICE_FEATURES >> 32,
                _ => 0,
            },
            device::DEVICE_FEATURES_SEL_OFFSET => state.device_features_sel as u64,
            device::DRIVER_FEATURES_OFFSET => state
                .driver_features
                .get(state.driver_features_sel as usize)
                .copied()
                .unwrap_or(0) as u64,
            device::DRIVER_FEATURES_SEL_OFFSET => state.driver_features_sel as u64,
            device::GUEST_PAGE_SIZE_OFFSET => state.page_size as u64,
            device::QUEUE_SEL_OFFSET => state.queue_sel as u64,
            device::QUEUE_NUM_MAX_OFFSET => queue.map_or(0, |q| q.max_size() as u64),
            device::QUEUE_NUM_OFFSET => queue.map_or(0, |q| q.num as u64),
            device::QUEUE_READY_OFFSET => queue.map_or(0, |q| q.is_ready() as u64),
            device::QUEUE_PFN_OFFSET => {
                queue.map_or(0, |q| q.desc / state.page_size.max(1) as u64)
            }
            device::INTERRUPT_STATUS_OFFSET => state.interrupt_status as u64,
            device::STATUS_OFFSET => state.status as u64,
            device::CONFIG_GENERATION_OFFSET => 0,
            off if off >= device::CONFIG_SPACE_OFFSET => {
                let cfg = state.config_space();
                let start = (off - device::CONFIG_SPACE_OFFSET) as usize;
                let mut word = [0u8; 4];
                for (i, b) in word.iter_mut().enumerate() {
                    *b = cfg.get(start + i).copied().unwrap_or(0);
                }
                u32::from_le_bytes(word) as u64
            }
            _ => 0,
        };
        Ok(val)
    }

    fn write(&self, offset: u64, val: u64) -> Result<(), MemoryError> {
        let val32 = val as u32;
        let output = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut output = Vec::new();

            match offset {
                device::DEVICE_FEATURES_SEL_OFFSET => {
                    state.device_features_sel = val32;
                }
                device::DRIVER_FEATURES_OFFSET => {
                    if let Some(word) = state
                        .driver_features
                        .get_mut(state.driver_features_sel as usize)
                    {
                        *word = val32;
                    }
                }
                device::DRIVER_FEATURES_SEL_OFFSET => {
                    state.driver_features_sel = val32;
                }
                device::GUEST_PAGE_SIZE_OFFSET => {
                    state.page_size = val32;
                }
                device::QUEUE_SEL_OFFSET => {
                    state.queue_sel = val32;
                }
                device::QUEUE_NUM_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        if val32 == 0 || val32 > q.max_size() as u32 {
                            log::warn!(
                                "[VirtioConsole] Queue {} size {} rejected (max {})",
                                state.queue_sel,
                                val32,
                                q.max_size()
                            );
                        } else {
                            q.num = val32 as u16;
                        }
                    }
                }
                device::QUEUE_PFN_OFFSET => {
                    let page_size = state.page_size;
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        q.set_pfn(val32, page_size);
                    }
                }
                device::QUEUE_READY_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        q.ready = val32 != 0;
                    }
                }
                device::QUEUE_NOTIFY_OFFSET => {
                    let effects = state.core.notify(val32);
                    output = state.absorb(effects);
                }
                device::INTERRUPT_ACK_OFFSET => {
                    state.interrupt_status &= !val32;
                }
                device::STATUS_OFFSET => {
                    if val32 == 0 {
                        state.reset();
                    } else {
                        state.status = val32;
                    }
                }
                device::QUEUE_DESC_LOW_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_low(&mut q.desc, val32);
                    }
                }
                device::QUEUE_DESC_HIGH_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_high(&mut q.desc, val32);
                    }
                }
                device::QUEUE_DRIVER_LOW_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_low(&mut q.avail, val32);
                    }
                }
                device::QUEUE_DRIVER_HIGH_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_high(&mut q.avail, val32);
                    }
                }
                device::QUEUE_DEVICE_LOW_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_low(&mut q.used, val32);
                    }
                }
                device::QUEUE_DEVICE_HIGH_OFFSET => {
                    if let Some(q) = state.core.queue_mut(state.queue_sel) {
                        set_high(&mut q.used, val32);
                    }
                }
                CONFIG_EMERG_WR => {
                    state.core.emergency_write(val32);
                }
                _ => {}
            }
            output
        };
        self.publish(output);
        Ok(())
    }
}
