use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use virtio_console::devices::virtio::console::{
    resize_payload, ControlEvent, ControlMessage, DeviceConfig, VirtioConsole,
};
use virtio_console::dram::{Dram, DRAM_BASE};
use virtio_console::guest::GuestDriver;
use virtio_console::host_bus::HostBus;
use virtio_console::terminal::{self, Terminal};

/// Receive buffers the echo guest keeps posted on port 0.
const RECEIVE_BUFFERS: u16 = 8;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESIZE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of ports, including port 0
    #[arg(long, default_value_t = 1)]
    ports: u32,

    /// Bit mask of ports 0..64 announced as text consoles
    #[arg(long, default_value_t = 0b1)]
    console_mask: u64,

    /// Additional console port, at any index (repeatable)
    #[arg(long = "console-port")]
    console_ports: Vec<u32>,

    /// Initial window rows (default: the terminal's, else 25)
    #[arg(long)]
    rows: Option<u16>,

    /// Initial window columns (default: the terminal's, else 80)
    #[arg(long)]
    cols: Option<u16>,

    /// Ring size offered for every virtqueue
    #[arg(long, default_value_t = 16)]
    queue_size: u16,

    /// Device name used to prefix host bus channels
    #[arg(long, default_value = "console")]
    name: String,

    /// Guest memory size in MiB
    #[arg(long, default_value_t = 4)]
    mem_mib: usize,

    /// Treat guest protocol violations as fatal
    #[arg(long)]
    strict: bool,
}

fn print_info(key: &str, value: &str) {
    eprintln!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (term_rows, term_cols) = terminal::window_size().unwrap_or((25, 80));
    let config = args.console_ports.iter().fold(
        DeviceConfig::default()
            .with_name(&args.name)
            .with_ports(args.ports, args.console_mask)
            .with_window(args.rows.unwrap_or(term_rows), args.cols.unwrap_or(term_cols))
            .with_queue_size(args.queue_size)
            .with_strict(args.strict),
        |config, &port| config.with_console_port(port),
    );

    let mem_bytes = args
        .mem_mib
        .checked_mul(1024 * 1024)
        .ok_or("Requested memory size is too large")?;
    let mem = Arc::new(Dram::new(DRAM_BASE, mem_bytes));
    let bus = Arc::new(HostBus::new());
    let console = VirtioConsole::new(config.clone(), Arc::clone(&mem), Arc::clone(&bus))?;

    bus.subscribe(&console.output_channel(0), |bytes| terminal::write_output(bytes));

    // Bring the guest side up: device ready, every port ready, port 0 open.
    let mut guest = GuestDriver::attach(console.clone(), mem)?;
    guest.send_control(ControlMessage::new(0, ControlEvent::DeviceReady, 1))?;
    for port in 0..guest.port_count() {
        guest.send_control(ControlMessage::new(port, ControlEvent::PortReady, 1))?;
    }
    guest.send_control(ControlMessage::new(0, ControlEvent::PortOpen, 1))?;
    for packet in guest.recv_control()? {
        log::debug!("[main] Guest received {:?}", packet);
    }
    guest.top_up_receive(0, RECEIVE_BUFFERS)?;

    eprintln!("\x1b[1;36mvirtio-console\x1b[0m");
    print_info("Device", console.name());
    print_info("Ports", &config.port_count.to_string());
    print_info("Window", &format!("{}x{}", config.rows, config.cols));
    print_info("Queue size", &config.queue_size.to_string());
    eprintln!("    \x1b[0;90mGuest echoes port 0. Press Ctrl-A then 'x' to terminate\x1b[0m\r");

    let mut term = Terminal::new()?;
    let mut escaped = false;
    let mut window = (config.rows, config.cols);
    let mut last_resize_check = Instant::now();

    'run: loop {
        let mut input = Vec::new();
        for b in term.read_available() {
            if escaped {
                escaped = false;
                match b {
                    b'x' => break 'run,
                    // Ctrl-A twice sends Ctrl-A to the guest
                    _ => input.push(b),
                }
            } else if b == 1 {
                escaped = true;
            } else {
                input.push(b);
            }
        }
        if !input.is_empty() {
            bus.publish(&console.input_channel(0), &input);
        }

        // The guest echoes everything it received back out of port 0.
        let echoed = guest.read_port(0)?;
        if !echoed.is_empty() {
            guest.write_port(0, &echoed)?;
        }
        guest.top_up_receive(0, RECEIVE_BUFFERS)?;

        if last_resize_check.elapsed() >= RESIZE_INTERVAL {
            last_resize_check = Instant::now();
            if let Some(size) = terminal::window_size() {
                if size != window {
                    window = size;
                    bus.publish(&console.resize_channel(0), &resize_payload(size.0, size.1));
                }
            }
        }
        for packet in guest.recv_control()? {
            log::debug!("[main] Guest received {:?}", packet);
        }
        guest.ack_interrupt()?;

        if term.is_closed() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    drop(term);

    let stats = console.stats();
    eprintln!();
    print_info("Bytes to guest", &stats.rx_bytes.to_string());
    print_info("Bytes from guest", &stats.tx_bytes.to_string());
    print_info("Input dropped", &stats.rx_dropped_bytes.to_string());
    print_info("Control sent", &stats.control_sent.to_string());
    print_info("Protocol errors", &stats.protocol_errors.to_string());
    print_info("Transport faults", &stats.transport_faults.to_string());
    Ok(())
}
