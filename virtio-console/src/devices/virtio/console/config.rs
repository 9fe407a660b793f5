use super::ConsoleError;
use crate::devices::virtio::device::QUEUE_SIZE;

/// Console device configuration, fixed once the device is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Prefix of every host bus channel this device uses.
    pub name: String,
    /// Initial window size.
    pub rows: u16,
    pub cols: u16,
    /// Number of ports, including port 0.
    pub port_count: u32,
    /// Bit `i % 64` of word `i / 64` set: port `i` is announced as a text
    /// console. Missing words are all clear.
    pub console_port_mask: Vec<u64>,
    /// Ring capacity offered for every queue.
    pub queue_size: u16,
    /// Treat protocol violations as fatal.
    pub strict: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "console".to_string(),
            rows: 25,
            cols: 80,
            port_count: 1,
            console_port_mask: vec![0b1],
            queue_size: QUEUE_SIZE,
            strict: cfg!(debug_assertions),
        }
    }
}

impl DeviceConfig {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_window(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    /// Set the port count; `console_port_mask` marks consoles among ports 0..64.
    pub fn with_ports(mut self, port_count: u32, console_port_mask: u64) -> Self {
        self.port_count = port_count;
        self.console_port_mask = vec![console_port_mask];
        self
    }

    /// Mark `port` as a text console, at any index.
    pub fn with_console_port(mut self, port: u32) -> Self {
        let word = (port / 64) as usize;
        if self.console_port_mask.len() <= word {
            self.console_port_mask.resize(word + 1, 0);
        }
        self.console_port_mask[word] |= 1u64 << (port % 64);
        self
    }

    pub fn with_queue_size(mut self, queue_size: u16) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_console(&self, port: u32) -> bool {
        self.console_port_mask
            .get((port / 64) as usize)
            .is_some_and(|word| word & (1u64 << (port % 64)) != 0)
    }

    /// Total number of virtqueues: two per port plus the control pair.
    pub fn queue_count(&self) -> u32 {
        2 * self.port_count + 2
    }

    pub fn validate(&self) -> Result<(), ConsoleError> {
        if self.port_count == 0 {
            return Err(ConsoleError::Config("port_count must be at least 1".into()));
        }
        // Queue indices are carried in a u32 notify register; keep the table sane.
        if self.port_count > 0x7fff {
            return Err(ConsoleError::Config(format!(
                "port_count {} is too large",
                self.port_count
            )));
        }
        if self.queue_size < 4 || !self.queue_size.is_power_of_two() {
            return Err(ConsoleError::Config(format!(
                "queue_size {} must be a power of two and at least 4",
                self.queue_size
            )));
        }
        if self.name.is_empty() {
            return Err(ConsoleError::Config("device name must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_count(), 4);
        assert!(config.is_console(0));
        assert!(!config.is_console(1));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(DeviceConfig::default().with_ports(0, 0).validate().is_err());
        assert!(DeviceConfig::default().with_queue_size(2).validate().is_err());
        assert!(DeviceConfig::default().with_queue_size(24).validate().is_err());
        assert!(DeviceConfig::default().with_name("").validate().is_err());
    }

    #[test]
    fn test_console_mask_beyond_64_ports() {
        let config = DeviceConfig::default().with_ports(100, u64::MAX);
        assert!(config.is_console(63));
        assert!(!config.is_console(64));
        assert_eq!(config.queue_count(), 202);

        let config = config.with_console_port(64).with_console_port(99);
        assert!(config.is_console(64));
        assert!(config.is_console(99));
        assert!(!config.is_console(98));
        assert!(!config.is_console(1000));
    }
}
