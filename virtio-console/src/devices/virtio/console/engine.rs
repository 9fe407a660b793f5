//! Control protocol state machine and per-port data forwarding.
//!
//! [`ConsoleCore`] owns the device's queues and reacts to three kinds of
//! events: a guest notification on a queue index, input bytes from the host
//! for a port, and a host window resize. Every entry point drains what it
//! can, flushes replies to the used rings and reports the bytes to publish on
//! the host bus through [`Effects`].

use super::ConsoleError;
use super::config::DeviceConfig;
use super::control::{ControlEvent, ControlMessage, ControlPacket, HEADER_LEN};
use super::router::{CONTROL_RX_QUEUE, CONTROL_TX_QUEUE, QueueHandler, QueueLayout};
use crate::devices::virtio::queue::{BufferChain, QueueError, Virtqueue};

/// Largest transmit payload copied out of a single guest buffer chain.
pub const MAX_TRANSMIT_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    /// Nothing is sent until the driver reports `DeviceReady`.
    AwaitingReady,
    /// Every port has been announced with `DeviceAdd`.
    PortsAnnounced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

/// Per-port bookkeeping derived from driver control messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortState {
    /// The driver sent `PortReady` for this port.
    pub ready: bool,
    /// Last `PortOpen` value received from the driver.
    pub guest_open: bool,
}

/// Counters for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleStats {
    /// Bytes forwarded guest → host
    pub tx_bytes: u64,
    /// Bytes delivered host → guest
    pub rx_bytes: u64,
    /// Host input bytes dropped for lack of guest buffers
    pub rx_dropped_bytes: u64,
    /// Control messages written to the control receive queue
    pub control_sent: u64,
    /// Control messages dropped for lack of guest buffers
    pub control_dropped: u64,
    /// Malformed or unexpected guest input
    pub protocol_errors: u64,
    /// Requests returned early by the ring-fullness safeguard
    pub ring_trims: u64,
    /// Events cut short by an unreadable ring or used-ring write failure
    pub transport_faults: u64,
}

/// Work produced by one event that must happen outside the device.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Effects {
    /// Guest output to publish, in ring order: `(port, bytes)`.
    pub output: Vec<(u32, Vec<u8>)>,
    /// At least one used ring advanced.
    pub interrupt: bool,
}

pub struct ConsoleCore<Q: Virtqueue> {
    config: DeviceConfig,
    layout: QueueLayout,
    queues: Vec<Q>,
    phase: ControlPhase,
    window: WindowSize,
    ports: Vec<PortState>,
    stats: ConsoleStats,
    output: Vec<(u32, Vec<u8>)>,
}

impl<Q: Virtqueue> ConsoleCore<Q> {
    /// Build the core over `queues`, which must follow the layout for
    /// `config.port_count` ports.
    pub fn new(config: DeviceConfig, queues: Vec<Q>) -> Result<Self, ConsoleError> {
        config.validate()?;
        let layout = QueueLayout::new(config.port_count);
        if queues.len() as u32 != layout.queue_count() {
            return Err(ConsoleError::Config(format!(
                "expected {} queues for {} ports, got {}",
                layout.queue_count(),
                config.port_count,
                queues.len()
            )));
        }
        Ok(Self {
            window: WindowSize {
                rows: config.rows,
                cols: config.cols,
            },
            ports: vec![PortState::default(); config.port_count as usize],
            config,
            layout,
            queues,
            phase: ControlPhase::AwaitingReady,
            stats: ConsoleStats::default(),
            output: Vec::new(),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    pub fn stats(&self) -> &ConsoleStats {
        &self.stats
    }

    pub fn port_state(&self, port: u32) -> Option<PortState> {
        self.ports.get(port as usize).copied()
    }

    pub fn queue(&self, index: u32) -> Option<&Q> {
        self.queues.get(index as usize)
    }

    pub fn queue_mut(&mut self, index: u32) -> Option<&mut Q> {
        self.queues.get_mut(index as usize)
    }

    /// Return to the initial phase after a device reset. The window size is
    /// host state and survives.
    pub fn reset_protocol(&mut self) {
        self.phase = ControlPhase::AwaitingReady;
        self.ports.fill(PortState::default());
        self.output.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a guest notification for queue `index`.
    pub fn notify(&mut self, index: u32) -> Effects {
        let role = match self.layout.role(index) {
            Ok(role) => role,
            Err(e) => {
                self.protocol_violation(e);
                return Effects::default();
            }
        };
        let result = match role.handler() {
            QueueHandler::ReceiveAvailable { .. } | QueueHandler::ControlReceiveAvailable => {
                self.trim_ring(index)
            }
            QueueHandler::TransmitForward { port } => self.forward_output(port, index),
            QueueHandler::ControlTransmitDispatch => self.dispatch_control(),
        };
        self.finish(result)
    }

    /// Deliver host input bytes to `port`. Bytes that do not fit in the
    /// currently posted receive buffers are dropped.
    pub fn deliver_input(&mut self, port: u32, bytes: &[u8]) -> Effects {
        let rx = match self.layout.receive_queue(port) {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("[VirtioConsole] Ignoring host input: {}", e);
                return Effects::default();
            }
        };
        let result = self.fill_receive(port, rx, bytes);
        self.finish(result)
    }

    /// Apply a host window resize and tell the driver if a control buffer is
    /// available right now.
    pub fn resize(&mut self, port: u32, rows: u16, cols: u16) -> Effects {
        if port >= self.config.port_count {
            log::warn!("[VirtioConsole] Ignoring resize: {}", ConsoleError::PortOutOfRange(port));
            return Effects::default();
        }
        self.window = WindowSize { rows, cols };
        let result = if self.queues[CONTROL_RX_QUEUE as usize].has_pending_request() {
            self.emit(ControlPacket::resize(port, rows, cols))
        } else {
            log::debug!(
                "[VirtioConsole] No control buffer, resize {}x{} for port {} not propagated",
                rows,
                cols,
                port
            );
            Ok(())
        };
        self.finish(result)
    }

    /// Guest wrote the emergency write register.
    pub fn emergency_write(&mut self, value: u32) {
        self.protocol_violation(ConsoleError::EmergencyWrite(value));
    }

    /// Publish staged replies on every queue and hand back the event's
    /// output. A fault ends the event but never hides completed work.
    fn finish(&mut self, result: Result<(), ConsoleError>) -> Effects {
        let mut fault = result.err();
        let mut interrupt = false;
        for (index, queue) in self.queues.iter_mut().enumerate() {
            match queue.flush_replies() {
                Ok(published) => interrupt |= published,
                Err(e) => {
                    log::error!("[VirtioConsole] Failed to publish replies on queue {}: {}", index, e);
                    fault.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = fault {
            self.stats.transport_faults += 1;
            log::error!("[VirtioConsole] Transport fault: {}", e);
        }
        Effects {
            output: std::mem::take(&mut self.output),
            interrupt,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Pop one request. `Ok(None)` means the slot held a malformed chain (it
    /// was consumed and returned empty by the transport) or the queue is empty.
    /// Only an unreadable ring is an error.
    fn pop(&mut self, index: u32) -> Result<Option<Q::Chain>, ConsoleError> {
        match self.queues[index as usize].pop_request() {
            Ok(chain) => Ok(Some(chain)),
            Err(QueueError::Empty) => Ok(None),
            Err(QueueError::Memory(e)) => Err(QueueError::Memory(e).into()),
            Err(e) => {
                self.protocol_violation(e.into());
                Ok(None)
            }
        }
    }

    /// Pop the next usable request, skipping malformed ones.
    fn pop_available(&mut self, index: u32) -> Result<Option<Q::Chain>, ConsoleError> {
        while self.queues[index as usize].has_pending_request() {
            if let Some(chain) = self.pop(index)? {
                return Ok(Some(chain));
            }
        }
        Ok(None)
    }

    /// Keep at least two ring slots unposted so a full ring can never look
    /// empty. Trimmed requests go back to the driver with zero length.
    fn trim_ring(&mut self, index: u32) -> Result<(), ConsoleError> {
        let limit = self.queues[index as usize].capacity().saturating_sub(2);
        while limit > 0 && self.queues[index as usize].pending_count() >= limit {
            if let Some(chain) = self.pop(index)? {
                self.queues[index as usize].push_reply(chain);
                self.stats.ring_trims += 1;
                log::debug!("[VirtioConsole] Ring safeguard trimmed a request on queue {}", index);
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Data forwarding
    // ═══════════════════════════════════════════════════════════════════════

    fn forward_output(&mut self, port: u32, tx: u32) -> Result<(), ConsoleError> {
        while self.queues[tx as usize].has_pending_request() {
            let Some(chain) = self.pop(tx)? else {
                continue;
            };
            let len = chain.readable_length();
            if len > MAX_TRANSMIT_LEN {
                log::warn!(
                    "[VirtioConsole] Port {} output of {} bytes truncated to {}",
                    port,
                    len,
                    MAX_TRANSMIT_LEN
                );
            }
            let mut data = vec![0u8; len.min(MAX_TRANSMIT_LEN)];
            let read = chain.read_blob(&mut data);
            self.queues[tx as usize].push_reply(chain);
            match read {
                Ok(n) => data.truncate(n),
                Err(e) => {
                    self.protocol_violation(e.into());
                    continue;
                }
            }

            log::trace!("[VirtioConsole] Port {} output: {}", port, hex::encode(&data));
            self.stats.tx_bytes += data.len() as u64;
            self.output.push((port, data));
        }
        Ok(())
    }

    fn fill_receive(&mut self, port: u32, rx: u32, bytes: &[u8]) -> Result<(), ConsoleError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let Some(mut chain) = self.pop_available(rx)? else {
                break;
            };
            let written = chain.write_blob(rest);
            self.queues[rx as usize].push_reply(chain);
            match written {
                Ok(n) => {
                    self.stats.rx_bytes += n as u64;
                    rest = &rest[n..];
                }
                Err(e) => self.protocol_violation(e.into()),
            }
        }
        if !rest.is_empty() {
            self.stats.rx_dropped_bytes += rest.len() as u64;
            log::debug!(
                "[VirtioConsole] No receive buffer on port {}, dropped {} bytes",
                port,
                rest.len()
            );
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control protocol
    // ═══════════════════════════════════════════════════════════════════════

    fn dispatch_control(&mut self) -> Result<(), ConsoleError> {
        let ctrl_tx = CONTROL_TX_QUEUE;
        while self.queues[ctrl_tx as usize].has_pending_request() {
            let Some(chain) = self.pop(ctrl_tx)? else {
                continue;
            };
            let mut header = [0u8; HEADER_LEN];
            let read = chain.read_blob(&mut header);
            // Acknowledge exactly once, before acting on the message.
            self.queues[ctrl_tx as usize].push_reply(chain);
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.protocol_violation(e.into());
                    continue;
                }
            };

            match ControlMessage::decode(&header[..n]) {
                Ok(msg) => self.handle_control(msg)?,
                Err(e) => self.protocol_violation(e.into()),
            }
        }
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<(), ConsoleError> {
        log::debug!("[VirtioConsole] Driver sent {}", msg);
        match msg.event {
            ControlEvent::DeviceReady => {
                if msg.value == 0 {
                    log::warn!("[VirtioConsole] Driver reported device initialisation failure");
                }
                self.announce_ports()
            }
            ControlEvent::PortReady => {
                let Some(state) = self.ports.get_mut(msg.port as usize) else {
                    self.protocol_violation(ConsoleError::PortOutOfRange(msg.port));
                    return Ok(());
                };
                state.ready = msg.value != 0;
                if msg.value == 0 {
                    log::warn!("[VirtioConsole] Driver failed to set up port {}", msg.port);
                }
                self.negotiate_port(msg.port)
            }
            ControlEvent::PortOpen => {
                let Some(state) = self.ports.get_mut(msg.port as usize) else {
                    self.protocol_violation(ConsoleError::PortOutOfRange(msg.port));
                    return Ok(());
                };
                state.guest_open = msg.value != 0;
                if msg.port == 0 {
                    let WindowSize { rows, cols } = self.window;
                    self.emit(ControlPacket::resize(0, rows, cols))?;
                }
                Ok(())
            }
            event => {
                self.protocol_violation(ConsoleError::UnexpectedEvent {
                    event,
                    port: msg.port,
                });
                Ok(())
            }
        }
    }

    fn announce_ports(&mut self) -> Result<(), ConsoleError> {
        for port in 0..self.config.port_count {
            self.emit(ControlPacket::simple(port, ControlEvent::DeviceAdd, 0))?;
        }
        self.phase = ControlPhase::PortsAnnounced;
        Ok(())
    }

    fn negotiate_port(&mut self, port: u32) -> Result<(), ConsoleError> {
        if self.config.is_console(port) {
            self.emit(ControlPacket::simple(port, ControlEvent::ConsolePort, 1))?;
        }
        self.emit(ControlPacket::port_name(port, &port_name(port)))?;
        self.emit(ControlPacket::simple(port, ControlEvent::PortOpen, 1))
    }

    /// Send a control message, dropping it if the driver has no buffer posted.
    fn emit(&mut self, packet: ControlPacket) -> Result<(), ConsoleError> {
        match self.send_control(&packet) {
            Err(e @ ConsoleError::NoBuffer(_)) => {
                self.stats.control_dropped += 1;
                log::warn!("[VirtioConsole] Dropping {}: {}", packet.header, e);
                Ok(())
            }
            other => other,
        }
    }

    fn send_control(&mut self, packet: &ControlPacket) -> Result<(), ConsoleError> {
        let Some(mut chain) = self.pop_available(CONTROL_RX_QUEUE)? else {
            return Err(ConsoleError::NoBuffer(CONTROL_RX_QUEUE));
        };
        let bytes = packet.to_bytes();
        let written = chain.write_blob(&bytes);
        self.queues[CONTROL_RX_QUEUE as usize].push_reply(chain);
        let n = match written {
            Ok(n) => n,
            Err(e) => {
                self.stats.control_dropped += 1;
                self.protocol_violation(e.into());
                return Ok(());
            }
        };
        if n < bytes.len() {
            log::warn!(
                "[VirtioConsole] Control buffer too small for {} ({} of {} bytes)",
                packet.header,
                n,
                bytes.len()
            );
        }
        self.stats.control_sent += 1;
        log::debug!("[VirtioConsole] Sent {} [{}]", packet.header, hex::encode(&bytes));
        Ok(())
    }

    fn protocol_violation(&mut self, err: ConsoleError) {
        self.stats.protocol_errors += 1;
        if self.config.strict {
            panic!("[VirtioConsole] protocol violation: {}", err);
        }
        log::warn!("[VirtioConsole] Protocol violation, dropped: {}", err);
    }
}

/// Name announced for `port`.
pub fn port_name(port: u32) -> String {
    format!("virtio-{}", port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::console::control::ControlPayload;
    use crate::devices::virtio::queue::testing::MemQueue;

    fn core(config: DeviceConfig) -> ConsoleCore<MemQueue> {
        let queues = (0..config.queue_count())
            .map(|_| MemQueue::new(config.queue_size))
            .collect();
        ConsoleCore::new(config.with_strict(false), queues).unwrap()
    }

    fn post_control_buffers(core: &mut ConsoleCore<MemQueue>, n: usize) {
        for _ in 0..n {
            core.queue_mut(CONTROL_RX_QUEUE).unwrap().post_empty(64);
        }
    }

    fn send(core: &mut ConsoleCore<MemQueue>, port: u32, event: ControlEvent, value: u16) -> Effects {
        let msg = ControlMessage::new(port, event, value);
        core.queue_mut(CONTROL_TX_QUEUE)
            .unwrap()
            .post_bytes(&msg.encode());
        core.notify(CONTROL_TX_QUEUE)
    }

    fn received(core: &mut ConsoleCore<MemQueue>) -> Vec<ControlPacket> {
        core.queue_mut(CONTROL_RX_QUEUE)
            .unwrap()
            .take_used()
            .iter()
            .map(|c| ControlPacket::parse(&c.data).unwrap())
            .collect()
    }

    #[test]
    fn test_device_ready_announces_every_port_in_order() {
        for n in 1..=8 {
            let mut core = core(DeviceConfig::default().with_ports(n, 0).with_queue_size(64));
            post_control_buffers(&mut core, 16);
            assert_eq!(core.phase(), ControlPhase::AwaitingReady);

            let effects = send(&mut core, 0, ControlEvent::DeviceReady, 1);
            assert!(effects.interrupt);
            assert_eq!(core.phase(), ControlPhase::PortsAnnounced);

            let msgs = received(&mut core);
            let expected: Vec<ControlPacket> = (0..n)
                .map(|p| ControlPacket::simple(p, ControlEvent::DeviceAdd, 0))
                .collect();
            assert_eq!(msgs, expected);
        }
    }

    #[test]
    fn test_nothing_is_sent_before_device_ready() {
        let mut core = core(DeviceConfig::default().with_ports(3, 0));
        post_control_buffers(&mut core, 4);
        let effects = core.notify(CONTROL_RX_QUEUE);
        assert!(!effects.interrupt);
        assert!(received(&mut core).is_empty());
    }

    #[test]
    fn test_console_port_negotiation_sequence() {
        let mut core = core(DeviceConfig::default().with_ports(3, 0b100));
        post_control_buffers(&mut core, 8);

        send(&mut core, 2, ControlEvent::PortReady, 1);
        assert_eq!(
            received(&mut core),
            vec![
                ControlPacket::simple(2, ControlEvent::ConsolePort, 1),
                ControlPacket::port_name(2, "virtio-2"),
                ControlPacket::simple(2, ControlEvent::PortOpen, 1),
            ]
        );
        assert_eq!(
            core.port_state(2),
            Some(PortState {
                ready: true,
                guest_open: false
            })
        );
    }

    #[test]
    fn test_console_port_beyond_first_mask_word() {
        let mut core = core(
            DeviceConfig::default()
                .with_ports(70, 0)
                .with_console_port(66)
                .with_queue_size(64),
        );
        post_control_buffers(&mut core, 8);

        send(&mut core, 66, ControlEvent::PortReady, 1);
        assert_eq!(
            received(&mut core),
            vec![
                ControlPacket::simple(66, ControlEvent::ConsolePort, 1),
                ControlPacket::port_name(66, "virtio-66"),
                ControlPacket::simple(66, ControlEvent::PortOpen, 1),
            ]
        );
    }

    #[test]
    fn test_raw_port_skips_console_announcement() {
        let mut core = core(DeviceConfig::default().with_ports(3, 0b100));
        post_control_buffers(&mut core, 8);

        send(&mut core, 1, ControlEvent::PortReady, 7);
        assert_eq!(
            received(&mut core),
            vec![
                ControlPacket::port_name(1, "virtio-1"),
                ControlPacket::simple(1, ControlEvent::PortOpen, 1),
            ]
        );
    }

    #[test]
    fn test_port_ready_is_acknowledged_once() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0b11));
        post_control_buffers(&mut core, 8);

        send(&mut core, 0, ControlEvent::PortReady, 1);
        let acks = core.queue_mut(CONTROL_TX_QUEUE).unwrap().take_used();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].written(), 0);
    }

    #[test]
    fn test_port_open_on_port_zero_reports_window() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0b1).with_window(30, 100));
        post_control_buffers(&mut core, 4);

        send(&mut core, 0, ControlEvent::PortOpen, 1);
        let msgs = received(&mut core);
        assert_eq!(msgs, vec![ControlPacket::resize(0, 30, 100)]);
        assert_eq!(msgs[0].header.value, 0);
        assert!(core.port_state(0).unwrap().guest_open);

        send(&mut core, 1, ControlEvent::PortOpen, 1);
        assert!(received(&mut core).is_empty());
        assert!(core.port_state(1).unwrap().guest_open);

        send(&mut core, 1, ControlEvent::PortOpen, 0);
        assert!(!core.port_state(1).unwrap().guest_open);
    }

    #[test]
    fn test_port_open_uses_latest_window() {
        let mut core = core(DeviceConfig::default().with_window(30, 100));
        // No control buffer: the resize is not propagated but is remembered.
        core.resize(0, 50, 132);
        assert!(received(&mut core).is_empty());
        assert_eq!(core.window(), WindowSize { rows: 50, cols: 132 });

        post_control_buffers(&mut core, 2);
        send(&mut core, 0, ControlEvent::PortOpen, 1);
        assert_eq!(received(&mut core), vec![ControlPacket::resize(0, 50, 132)]);
    }

    #[test]
    fn test_resize_with_buffer_sends_immediately() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0));
        post_control_buffers(&mut core, 1);
        let effects = core.resize(1, 40, 120);
        assert!(effects.interrupt);
        let msgs = received(&mut core);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.port, 1);
        assert_eq!(msgs[0].payload, ControlPayload::Size { rows: 40, cols: 120 });

        assert_eq!(core.resize(5, 1, 1), Effects::default());
        assert_eq!(core.window(), WindowSize { rows: 40, cols: 120 });
    }

    #[test]
    fn test_transmit_forwards_each_buffer_in_order() {
        let mut core = core(DeviceConfig::default().with_ports(3, 0));
        let tx = core.layout().transmit_queue(2).unwrap();
        let payloads: [&[u8]; 3] = [b"first", b"", &[0u8, 255, 10, 13]];
        for p in payloads {
            core.queue_mut(tx).unwrap().post_bytes(p);
        }

        let effects = core.notify(tx);
        assert!(effects.interrupt);
        assert_eq!(
            effects.output,
            payloads.iter().map(|p| (2, p.to_vec())).collect::<Vec<_>>()
        );
        let acks = core.queue_mut(tx).unwrap().take_used();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|c| c.written() == 0));
        assert_eq!(core.stats().tx_bytes, 9);
    }

    #[test]
    fn test_unreadable_transmit_buffer_does_not_stall_the_queue() {
        let mut core = core(DeviceConfig::default());
        core.queue_mut(1).unwrap().post_bytes(b"good");
        core.queue_mut(1).unwrap().post_faulty();
        core.queue_mut(1).unwrap().post_bytes(b"after");

        let effects = core.notify(1);
        assert!(effects.interrupt);
        assert_eq!(
            effects.output,
            vec![(0, b"good".to_vec()), (0, b"after".to_vec())]
        );
        assert_eq!(core.queue_mut(1).unwrap().take_used().len(), 3);
        assert_eq!(core.queue(1).unwrap().pending_count(), 0);
        assert_eq!(core.stats().protocol_errors, 1);
        assert_eq!(core.stats().transport_faults, 0);

        // Nothing is left over for the next event.
        assert_eq!(core.deliver_input(0, b""), Effects::default());
    }

    #[test]
    fn test_unwritable_receive_buffer_is_skipped() {
        let mut core = core(DeviceConfig::default());
        core.queue_mut(0).unwrap().post_faulty();
        core.queue_mut(0).unwrap().post_empty(8);

        let effects = core.deliver_input(0, b"hi");
        assert!(effects.interrupt);
        let used = core.queue_mut(0).unwrap().take_used();
        assert_eq!(used.len(), 2);
        assert_eq!(used[1].data, b"hi");
        assert_eq!(core.stats().rx_bytes, 2);
        assert_eq!(core.stats().protocol_errors, 1);
    }

    #[test]
    fn test_unwritable_control_buffer_drops_the_message() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0));
        core.queue_mut(CONTROL_RX_QUEUE).unwrap().post_faulty();
        post_control_buffers(&mut core, 2);

        send(&mut core, 0, ControlEvent::DeviceReady, 1);
        let used = core.queue_mut(CONTROL_RX_QUEUE).unwrap().take_used();
        assert_eq!(used.len(), 2);
        assert_eq!(
            ControlPacket::parse(&used[1].data).unwrap(),
            ControlPacket::simple(1, ControlEvent::DeviceAdd, 0)
        );
        assert_eq!(core.stats().control_dropped, 1);
        assert_eq!(core.stats().control_sent, 1);
        assert_eq!(core.phase(), ControlPhase::PortsAnnounced);
    }

    #[test]
    fn test_failed_flush_on_one_queue_does_not_hold_back_others() {
        let mut core = core(DeviceConfig::default());
        post_control_buffers(&mut core, 2);
        core.queue_mut(CONTROL_RX_QUEUE).unwrap().fail_flush = true;

        let effects = send(&mut core, 0, ControlEvent::DeviceReady, 1);
        // The control transmit ack after the failing queue still went out.
        assert!(effects.interrupt);
        assert_eq!(core.queue_mut(CONTROL_TX_QUEUE).unwrap().take_used().len(), 1);
        assert!(received(&mut core).is_empty());
        assert_eq!(core.stats().transport_faults, 1);

        core.queue_mut(CONTROL_RX_QUEUE).unwrap().fail_flush = false;
        core.notify(CONTROL_RX_QUEUE);
        assert_eq!(
            received(&mut core),
            vec![ControlPacket::simple(0, ControlEvent::DeviceAdd, 0)]
        );
    }

    #[test]
    fn test_input_without_buffer_is_dropped() {
        let mut core = core(DeviceConfig::default());
        let effects = core.deliver_input(0, b"lost");
        assert_eq!(effects, Effects::default());
        assert_eq!(core.stats().rx_dropped_bytes, 4);
        assert!(core.queue_mut(0).unwrap().take_used().is_empty());
    }

    #[test]
    fn test_input_fills_posted_buffers() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0));
        let rx = core.layout().receive_queue(1).unwrap();
        core.queue_mut(rx).unwrap().post_empty(4);
        core.queue_mut(rx).unwrap().post_empty(4);

        let effects = core.deliver_input(1, b"abcdefghij");
        assert!(effects.interrupt);
        let used = core.queue_mut(rx).unwrap().take_used();
        assert_eq!(used.len(), 2);
        assert_eq!(used[0].data, b"abcd");
        assert_eq!(used[1].data, b"efgh");
        assert_eq!(core.stats().rx_bytes, 8);
        assert_eq!(core.stats().rx_dropped_bytes, 2);
    }

    #[test]
    fn test_input_for_unknown_port_is_ignored() {
        let mut core = core(DeviceConfig::default());
        assert_eq!(core.deliver_input(3, b"x"), Effects::default());
    }

    #[test]
    fn test_ring_safeguard_on_receive_queues() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0).with_queue_size(16));
        for rx in [0, CONTROL_RX_QUEUE, 4] {
            for _ in 0..15 {
                core.queue_mut(rx).unwrap().post_empty(8);
            }
            let effects = core.notify(rx);
            assert!(effects.interrupt);
            assert_eq!(core.queue(rx).unwrap().pending_count(), 13);
            let trimmed = core.queue_mut(rx).unwrap().take_used();
            assert_eq!(trimmed.len(), 2);
            // Oldest first.
            assert!(trimmed[0].id < trimmed[1].id);
            assert!(trimmed.iter().all(|c| c.written() == 0));
        }
        assert_eq!(core.stats().ring_trims, 6);
    }

    #[test]
    fn test_ring_safeguard_leaves_short_rings_alone() {
        let mut core = core(DeviceConfig::default());
        for _ in 0..13 {
            core.queue_mut(0).unwrap().post_empty(8);
        }
        let effects = core.notify(0);
        assert!(!effects.interrupt);
        assert_eq!(core.queue(0).unwrap().pending_count(), 13);
    }

    #[test]
    fn test_control_without_buffers_is_dropped() {
        let mut core = core(DeviceConfig::default().with_ports(3, 0));
        post_control_buffers(&mut core, 1);
        send(&mut core, 0, ControlEvent::DeviceReady, 1);
        assert_eq!(received(&mut core).len(), 1);
        assert_eq!(core.stats().control_sent, 1);
        assert_eq!(core.stats().control_dropped, 2);
    }

    #[test]
    fn test_protocol_violations_are_dropped() {
        let mut core = core(DeviceConfig::default().with_ports(2, 0));
        post_control_buffers(&mut core, 4);

        // Unknown event code.
        let mut raw = ControlMessage::new(0, ControlEvent::PortReady, 1).encode();
        raw[4] = 42;
        core.queue_mut(CONTROL_TX_QUEUE).unwrap().post_bytes(&raw);
        // Truncated header.
        core.queue_mut(CONTROL_TX_QUEUE).unwrap().post_bytes(&raw[..5]);
        core.notify(CONTROL_TX_QUEUE);

        // Device-to-driver event sent by the driver.
        send(&mut core, 0, ControlEvent::DeviceAdd, 0);
        // Port out of range.
        send(&mut core, 9, ControlEvent::PortReady, 1);
        // Queue that does not exist.
        core.notify(6);

        assert_eq!(core.stats().protocol_errors, 5);
        assert!(received(&mut core).is_empty());
        // Every driver message was still acknowledged.
        assert_eq!(core.queue_mut(CONTROL_TX_QUEUE).unwrap().take_used().len(), 4);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_strict_mode_panics_on_violation() {
        let config = DeviceConfig::default().with_strict(true);
        let queues = (0..config.queue_count())
            .map(|_| MemQueue::new(config.queue_size))
            .collect();
        let mut core = ConsoleCore::new(config, queues).unwrap();
        core.emergency_write(0x41);
    }

    #[test]
    fn test_reset_returns_to_awaiting_ready() {
        let mut core = core(DeviceConfig::default());
        post_control_buffers(&mut core, 4);
        send(&mut core, 0, ControlEvent::DeviceReady, 1);
        send(&mut core, 0, ControlEvent::PortReady, 1);
        core.reset_protocol();
        assert_eq!(core.phase(), ControlPhase::AwaitingReady);
        assert_eq!(core.port_state(0), Some(PortState::default()));
    }

    #[test]
    fn test_rejects_wrong_queue_count() {
        let queues = vec![MemQueue::new(16), MemQueue::new(16)];
        assert!(matches!(
            ConsoleCore::new(DeviceConfig::default(), queues),
            Err(ConsoleError::Config(_))
        ));
    }
}
