//! Control queue wire format.
//!
//! Every control message starts with an 8-byte little-endian header:
//!
//! ```text
//! +--------------+-------------+-------------+
//! | port: u32    | event: u16  | value: u16  |
//! +--------------+-------------+-------------+
//! ```
//!
//! `PortName` appends the name bytes and a NUL terminator, `Resize` appends
//! `rows: u16, cols: u16`.

use std::fmt;

use thiserror::Error;

pub const HEADER_LEN: usize = 8;
pub const RESIZE_PAYLOAD_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("control message truncated: {0} bytes")]
    Truncated(usize),

    #[error("unknown control event {0}")]
    UnknownEvent(u16),

    #[error("port name is not NUL-terminated")]
    UnterminatedName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlEvent {
    DeviceReady = 0,
    DeviceAdd = 1,
    DeviceRemove = 2,
    PortReady = 3,
    ConsolePort = 4,
    Resize = 5,
    PortOpen = 6,
    PortName = 7,
}

impl TryFrom<u16> for ControlEvent {
    type Error = ControlError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => ControlEvent::DeviceReady,
            1 => ControlEvent::DeviceAdd,
            2 => ControlEvent::DeviceRemove,
            3 => ControlEvent::PortReady,
            4 => ControlEvent::ConsolePort,
            5 => ControlEvent::Resize,
            6 => ControlEvent::PortOpen,
            7 => ControlEvent::PortName,
            other => return Err(ControlError::UnknownEvent(other)),
        })
    }
}

/// The fixed control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub port: u32,
    pub event: ControlEvent,
    pub value: u16,
}

impl ControlMessage {
    pub fn new(port: u32, event: ControlEvent, value: u16) -> Self {
        Self { port, event, value }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.port.to_le_bytes());
        out[4..6].copy_from_slice(&(self.event as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    /// Decode the header at the front of `bytes`; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        if bytes.len() < HEADER_LEN {
            return Err(ControlError::Truncated(bytes.len()));
        }
        let port = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let event = u16::from_le_bytes([bytes[4], bytes[5]]);
        let value = u16::from_le_bytes([bytes[6], bytes[7]]);
        Ok(Self {
            port,
            event: ControlEvent::try_from(event)?,
            value,
        })
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(port={}, value={})", self.event, self.port, self.value)
    }
}

/// Variable trailer following the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    None,
    Name(String),
    Size { rows: u16, cols: u16 },
}

/// A complete control message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub header: ControlMessage,
    pub payload: ControlPayload,
}

impl ControlPacket {
    pub fn simple(port: u32, event: ControlEvent, value: u16) -> Self {
        Self {
            header: ControlMessage::new(port, event, value),
            payload: ControlPayload::None,
        }
    }

    pub fn port_name(port: u32, name: &str) -> Self {
        Self {
            header: ControlMessage::new(port, ControlEvent::PortName, 1),
            payload: ControlPayload::Name(name.to_string()),
        }
    }

    pub fn resize(port: u32, rows: u16, cols: u16) -> Self {
        Self {
            header: ControlMessage::new(port, ControlEvent::Resize, 0),
            payload: ControlPayload::Size { rows, cols },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.encode().to_vec();
        match &self.payload {
            ControlPayload::None => {}
            ControlPayload::Name(name) => {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
            ControlPayload::Size { rows, cols } => {
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(&cols.to_le_bytes());
            }
        }
        out
    }

    /// Parse a full packet, interpreting the trailer according to the event.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        let header = ControlMessage::decode(bytes)?;
        let rest = &bytes[HEADER_LEN..];
        let payload = match header.event {
            ControlEvent::PortName => {
                let nul = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(ControlError::UnterminatedName)?;
                ControlPayload::Name(String::from_utf8_lossy(&rest[..nul]).into_owned())
            }
            ControlEvent::Resize => {
                if rest.len() < RESIZE_PAYLOAD_LEN {
                    return Err(ControlError::Truncated(bytes.len()));
                }
                ControlPayload::Size {
                    rows: u16::from_le_bytes([rest[0], rest[1]]),
                    cols: u16::from_le_bytes([rest[2], rest[3]]),
                }
            }
            _ => ControlPayload::None,
        };
        Ok(Self { header, payload })
    }
}
