//! Line transport over a serial device (C1).
//!
//! Owns the serial file descriptor on a dedicated OS thread — the read
//! syscall blocks for up to `VTIME` with no cooperative yield point, so it
//! cannot run as a tokio task without stalling the runtime. The thread pulls
//! available bytes, appends them to a rolling buffer, and emits complete
//! lines split on `\r\n` or `\n` (either accepted, in any mixture) to an
//! unbounded channel the protocol engine owns.
//!
//! Every emitted line is additionally copied to a raw-tap broadcast channel
//! tagged `RX:`; every outbound write is copied tagged `TX:`. A lagging tap
//! subscriber drops its oldest buffered messages rather than stalling the
//! reader — that is `tokio::sync::broadcast`'s native behavior.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::EngineError;

/// Raw-tap broadcast capacity. Lagging subscribers drop their oldest
/// buffered messages once this fills, per [`tokio::sync::broadcast`].
const RAW_TAP_CAPACITY: usize = 512;

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Map a baud rate integer to nix's `BaudRate` enum. Unsupported rates fail
/// at `open` time rather than silently picking the nearest one.
fn baud_rate(baud: u32) -> Result<BaudRate, EngineError> {
    match baud {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        230400 => Ok(BaudRate::B230400),
        460800 => Ok(BaudRate::B460800),
        921600 => Ok(BaudRate::B921600),
        other => Err(EngineError::TransportIO(format!(
            "unsupported baud rate: {other}"
        ))),
    }
}

/// Configure termios: raw mode, given baud, 8N1, no flow control.
/// VMIN=0, VTIME=1 → reads return after 100ms of silence.
fn configure_termios(fd: RawFd, baud: BaudRate) -> Result<(), EngineError> {
    let io = |e: nix::Error| EngineError::TransportIO(e.to_string());
    // SAFETY: fd is valid — caller just opened it.
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed).map_err(io)?;
    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, baud).map_err(io)?;
    termios::cfsetospeed(&mut tio, baud).map_err(io)?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(io)?;
    Ok(())
}

/// Owns a serial device and the background reader thread that frames it into
/// lines.
pub struct Transport {
    fd: RawFd,
    device: String,
    raw_tap: broadcast::Sender<String>,
    shutdown: Arc<AtomicBool>,
    reader_handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Transport {
    /// Open a serial device and spawn the reader thread. Returns the
    /// transport plus the channel of classified lines (the engine's to own).
    pub fn open(
        device: &str,
        baud: u32,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), EngineError> {
        let baud = baud_rate(baud)?;
        let io = |e: nix::Error| EngineError::TransportIO(e.to_string());

        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(io)?;

        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(io)?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags)).map_err(io)?;

        configure_termios(fd, baud)?;

        // SAFETY: fd is valid — we just opened and configured it.
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH).map_err(io)?;
        }

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (raw_tap, _) = broadcast::channel(RAW_TAP_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let dev_name = device.to_string();
        let reader_tap = raw_tap.clone();
        let reader_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("transport-{dev_name}"))
            .spawn(move || reader_thread(fd, lines_tx, reader_tap, reader_shutdown, &dev_name))
            .map_err(|e| EngineError::TransportIO(format!("spawn reader thread: {e}")))?;

        Ok((
            Self {
                fd,
                device: device.to_string(),
                raw_tap,
                shutdown,
                reader_handle: std::sync::Mutex::new(Some(handle)),
            },
            lines_rx,
        ))
    }

    /// Device path this transport is bound to.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Write a line, framed with a trailing `\r\n`. Copies the text to the
    /// raw-tap channel tagged `TX:`.
    pub fn write_line(&self, text: &str) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::TransportClosed);
        }
        // SAFETY: fd remains open for the lifetime of this Transport.
        let bfd = unsafe { borrow_fd(self.fd) };
        let framed = format!("{text}\r\n");
        unistd::write(bfd, framed.as_bytes())
            .map_err(|e| EngineError::TransportIO(e.to_string()))?;
        let _ = self.raw_tap.send(format!("TX: {text}"));
        Ok(())
    }

    /// Subscribe to the raw-tap channel (all `RX:`/`TX:` lines).
    pub fn subscribe_raw(&self) -> broadcast::Receiver<String> {
        self.raw_tap.subscribe()
    }

    /// Signal the reader to stop and join it, waiting up to 2s.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.reader_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join());
            let _ = tokio::time::timeout(Duration::from_secs(2), joined).await;
        }
    }
}

/// Blocking reader thread: reads bytes, frames lines, classifies nothing
/// itself — just publishes lines. Lossy UTF-8 so noise never breaks framing.
fn reader_thread(
    fd: RawFd,
    lines_tx: mpsc::UnboundedSender<String>,
    raw_tap: broadcast::Sender<String>,
    shutdown: Arc<AtomicBool>,
    device: &str,
) {
    let mut rolling = String::new();
    let mut buf = [0u8; 1024];

    while !shutdown.load(Ordering::Acquire) {
        match unistd::read(fd, &mut buf) {
            Ok(0) => {} // VTIME expired, no data
            Ok(n) => {
                rolling.push_str(&String::from_utf8_lossy(&buf[..n]));
                loop {
                    let split_at = match (rolling.find("\r\n"), rolling.find('\n')) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (Some(a), None) => Some(a),
                        (None, Some(b)) => Some(b),
                        (None, None) => None,
                    };
                    let Some(idx) = split_at else { break };
                    let sep_len = if rolling[idx..].starts_with("\r\n") { 2 } else { 1 };
                    let line = rolling[..idx].trim().to_string();
                    rolling.drain(..idx + sep_len);

                    if line.is_empty() {
                        continue;
                    }
                    debug!("Transport {device} RX: {line}");
                    let _ = raw_tap.send(format!("RX: {line}"));
                    if lines_tx.send(line).is_err() {
                        // Engine dropped its receiver — nothing left to do.
                        let _ = unistd::close(fd);
                        return;
                    }
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => {
                warn!("Transport {device}: read error: {e}");
                break;
            }
        }
    }

    let _ = unistd::close(fd);
    debug!("Transport {device}: reader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_known() {
        assert!(baud_rate(115200).is_ok());
        assert!(baud_rate(9600).is_ok());
    }

    #[test]
    fn test_baud_rate_unknown() {
        assert!(baud_rate(12345).is_err());
    }
}
