//! Operator terminal helpers.

use crate::executor::{poll_readable, read_fd};
use crate::interrupt::Interrupts;
use crossterm::terminal;
use std::io::{self, IsTerminal};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{debug, warn};

pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Columns and rows of the operator's terminal, 80x24 when unknown.
pub fn size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => FALLBACK_SIZE,
    }
}

pub fn stdin_is_terminal() -> bool {
    io::stdin().is_terminal()
}

type Restore = Box<dyn FnOnce() -> io::Result<()>>;

/// Keeps the terminal in raw mode while alive.
///
/// Dropping the guard restores cooked mode, including during unwinding.
pub struct RawModeGuard {
    restore: Option<Restore>,
}

impl RawModeGuard {
    /// Switch to raw mode. When stdin is not a terminal there is nothing to
    /// switch and the guard is inert.
    pub fn acquire() -> Self {
        if !stdin_is_terminal() {
            return Self::inert();
        }
        match terminal::enable_raw_mode() {
            Ok(()) => {
                debug!("raw mode enabled");
                Self::with_restore(terminal::disable_raw_mode)
            }
            Err(e) => {
                warn!(error = %e, "could not enable raw mode");
                Self::inert()
            }
        }
    }

    /// Raw mode for the engine's input descriptor: only the real stdin is
    /// ever switched.
    pub fn for_input(fd: RawFd) -> Self {
        if fd == libc::STDIN_FILENO {
            Self::acquire()
        } else {
            Self::inert()
        }
    }

    /// A guard that runs `restore` when dropped. The caller has already
    /// switched the mode.
    pub fn with_restore(restore: impl FnOnce() -> io::Result<()> + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    pub fn inert() -> Self {
        Self { restore: None }
    }

    pub fn is_active(&self) -> bool {
        self.restore.is_some()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            if let Err(e) = restore() {
                warn!(error = %e, "could not restore terminal mode");
            }
            debug!("raw mode disabled");
        }
    }
}

/// What the operator did at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Line(String),
    Interrupted,
    Eof,
}

/// Line reader for the shell prompt that gives up when Ctrl+C arrives.
///
/// The `ctrlc` handler restarts blocking reads, so a plain `read_line`
/// would only notice the interrupt after Enter. This reader polls the
/// descriptor and checks the interrupt counter between waits. It reads
/// the raw descriptor, so nothing stays buffered that the engine would
/// miss when it forwards keystrokes.
pub struct LineReader {
    fd: RawFd,
    poll_interval: Duration,
    pending: Vec<u8>,
    eof: bool,
}

impl LineReader {
    pub fn new(fd: RawFd, poll_interval: Duration) -> Self {
        Self {
            fd,
            poll_interval,
            pending: Vec::new(),
            eof: false,
        }
    }

    pub fn stdin(poll_interval: Duration) -> Self {
        Self::new(libc::STDIN_FILENO, poll_interval)
    }

    /// Next line without its terminator. The interrupt counter is left for
    /// the caller to take.
    pub fn read_line(&mut self, interrupts: &Interrupts) -> io::Result<PromptInput> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(PromptInput::Line(decode_line(&line[..pos])));
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(PromptInput::Eof);
                }
                let rest = std::mem::take(&mut self.pending);
                return Ok(PromptInput::Line(decode_line(&rest)));
            }
            if interrupts.is_raised() {
                self.pending.clear();
                return Ok(PromptInput::Interrupted);
            }

            let ready = poll_readable(None, Some(self.fd), self.poll_interval)?;
            if ready.input_gone {
                self.eof = true;
                continue;
            }
            if !ready.input {
                continue;
            }
            match read_fd(self.fd, &mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_never_zero() {
        let (cols, rows) = size();
        assert!(cols > 0 && rows > 0);
    }

    #[test]
    fn inert_guard_does_nothing_on_drop() {
        let guard = RawModeGuard::inert();
        assert!(!guard.is_active());
        drop(guard);
    }

    #[test]
    fn restore_runs_once_on_drop() {
        use std::cell::Cell;
        use std::rc::Rc;

        let restored = Rc::new(Cell::new(0));
        let counter = Rc::clone(&restored);
        let guard = RawModeGuard::with_restore(move || {
            counter.set(counter.get() + 1);
            Ok(())
        });
        assert!(guard.is_active());
        assert_eq!(restored.get(), 0);
        drop(guard);
        assert_eq!(restored.get(), 1);
    }

    #[test]
    fn piped_input_never_switches_mode() {
        let (read_end, write_end) = pipe();
        assert!(!RawModeGuard::for_input(read_end).is_active());
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn write_all(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    #[test]
    fn line_reader_splits_lines_and_reports_eof() {
        let (read_end, write_end) = pipe();
        write_all(write_end, b"whoami\r\nid\nls -la");
        unsafe { libc::close(write_end) };

        let interrupts = Interrupts::new();
        let mut reader = LineReader::new(read_end, Duration::from_millis(10));
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Line("whoami".into()));
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Line("id".into()));
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Line("ls -la".into()));
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Eof);
        unsafe { libc::close(read_end) };
    }

    #[test]
    fn line_reader_returns_on_interrupt_without_enter() {
        let (read_end, write_end) = pipe();
        write_all(write_end, b"half typed");

        let interrupts = Interrupts::new();
        let trigger = interrupts.clone();
        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.raise();
        });
        let mut reader = LineReader::new(read_end, Duration::from_millis(10));
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Interrupted);
        raiser.join().unwrap();
        assert_eq!(interrupts.take(), 1);

        // the cancelled fragment is gone
        write_all(write_end, b"next\n");
        assert_eq!(reader.read_line(&interrupts).unwrap(), PromptInput::Line("next".into()));
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }
}
