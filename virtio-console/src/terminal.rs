//! Host terminal backend for native builds.

#![cfg(not(target_arch = "wasm32"))]

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

/// Non-blocking terminal input.
///
/// A background thread reads stdin in chunks and makes the bytes available
/// via `read_available()`. Raw mode is held for the lifetime of the value.
pub struct Terminal {
    rx: Receiver<Vec<u8>>,
    closed: bool,
    _raw: Option<RawModeGuard>,
    _handle: JoinHandle<()>,
}

impl Terminal {
    pub fn new() -> io::Result<Self> {
        let raw = RawModeGuard::new();
        if raw.is_none() {
            log::debug!("[Terminal] stdin is not a tty, raw mode not enabled");
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("terminal-input".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                let mut buffer = [0u8; 256];
                loop {
                    match stdin.lock().read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buffer[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            log::error!("[Terminal] stdin read failed: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            rx,
            closed: false,
            _raw: raw,
            _handle: handle,
        })
    }

    /// Drain every chunk read so far.
    pub fn read_available(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        bytes
    }

    /// stdin reached EOF or failed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Write guest output to stdout.
pub fn write_output(bytes: &[u8]) {
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(bytes).and_then(|_| stdout.flush()) {
        log::warn!("[Terminal] stdout write failed: {}", e);
    }
}

/// Current terminal size as `(rows, cols)`.
#[cfg(unix)]
pub fn window_size() -> Option<(u16, u16)> {
    use std::os::unix::io::AsRawFd;

    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(io::stdout().as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return None;
    }
    Some((ws.ws_row, ws.ws_col))
}

#[cfg(not(unix))]
pub fn window_size() -> Option<(u16, u16)> {
    None
}

/// RAII guard for Unix raw terminal mode.
#[cfg(unix)]
struct RawModeGuard {
    original: libc::termios,
}

#[cfg(unix)]
impl RawModeGuard {
    fn new() -> Option<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = io::stdin().as_raw_fd();
        let mut original = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, original.as_mut_ptr()) != 0 {
                return None;
            }
            let original = original.assume_init();

            let mut raw = original;
            // Disable canonical mode, echo and signal keys so ^C reaches the guest
            raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG);
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return None;
            }
            Some(Self { original })
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
        let _ = io::stdout().flush();
    }
}

#[cfg(not(unix))]
struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    fn new() -> Option<Self> {
        None
    }
}
