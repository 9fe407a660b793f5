//! Queue index to role mapping.
//!
//! Layout for `n` ports:
//!
//! ```text
//! 0: port 0 receive     1: port 0 transmit
//! 2: control receive    3: control transmit
//! 4: port 1 receive     5: port 1 transmit
//! ...
//! 2p+2: port p receive  2p+3: port p transmit
//! ```

use super::ConsoleError;

pub const CONTROL_RX_QUEUE: u32 = 2;
pub const CONTROL_TX_QUEUE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Port0Receive,
    Port0Transmit,
    ControlReceive,
    ControlTransmit,
    PortNReceive(u32),
    PortNTransmit(u32),
}

/// What the device does when a queue is notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHandler {
    /// Driver posted empty buffers for port input.
    ReceiveAvailable { port: u32 },
    /// Driver queued port output.
    TransmitForward { port: u32 },
    /// Driver posted empty buffers for control messages.
    ControlReceiveAvailable,
    /// Driver queued control messages.
    ControlTransmitDispatch,
}

impl QueueRole {
    pub fn port(&self) -> Option<u32> {
        match *self {
            QueueRole::Port0Receive | QueueRole::Port0Transmit => Some(0),
            QueueRole::PortNReceive(p) | QueueRole::PortNTransmit(p) => Some(p),
            QueueRole::ControlReceive | QueueRole::ControlTransmit => None,
        }
    }

    pub fn handler(&self) -> QueueHandler {
        match *self {
            QueueRole::Port0Receive => QueueHandler::ReceiveAvailable { port: 0 },
            QueueRole::PortNReceive(port) => QueueHandler::ReceiveAvailable { port },
            QueueRole::Port0Transmit => QueueHandler::TransmitForward { port: 0 },
            QueueRole::PortNTransmit(port) => QueueHandler::TransmitForward { port },
            QueueRole::ControlReceive => QueueHandler::ControlReceiveAvailable,
            QueueRole::ControlTransmit => QueueHandler::ControlTransmitDispatch,
        }
    }

    /// Queues the guest fills with empty buffers for the device to write.
    pub fn is_receive(&self) -> bool {
        matches!(
            self,
            QueueRole::Port0Receive | QueueRole::PortNReceive(_) | QueueRole::ControlReceive
        )
    }
}

/// Role table built once from the declared queue layout.
#[derive(Debug, Clone)]
pub struct QueueLayout {
    roles: Vec<QueueRole>,
    port_queues: Vec<(u32, u32)>,
}

impl QueueLayout {
    pub fn new(port_count: u32) -> Self {
        let mut roles = vec![
            QueueRole::Port0Receive,
            QueueRole::Port0Transmit,
            QueueRole::ControlReceive,
            QueueRole::ControlTransmit,
        ];
        let mut port_queues = vec![(0, 1)];
        for port in 1..port_count {
            let rx = roles.len() as u32;
            roles.push(QueueRole::PortNReceive(port));
            roles.push(QueueRole::PortNTransmit(port));
            port_queues.push((rx, rx + 1));
        }
        Self { roles, port_queues }
    }

    pub fn queue_count(&self) -> u32 {
        self.roles.len() as u32
    }

    pub fn port_count(&self) -> u32 {
        self.port_queues.len() as u32
    }

    pub fn role(&self, index: u32) -> Result<QueueRole, ConsoleError> {
        self.roles
            .get(index as usize)
            .copied()
            .ok_or(ConsoleError::UnknownQueue(index))
    }

    pub fn receive_queue(&self, port: u32) -> Result<u32, ConsoleError> {
        self.port_queues
            .get(port as usize)
            .map(|&(rx, _)| rx)
            .ok_or(ConsoleError::PortOutOfRange(port))
    }

    pub fn transmit_queue(&self, port: u32) -> Result<u32, ConsoleError> {
        self.port_queues
            .get(port as usize)
            .map(|&(_, tx)| tx)
            .ok_or(ConsoleError::PortOutOfRange(port))
    }
}
