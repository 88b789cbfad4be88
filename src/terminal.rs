//! Local terminal control: raw mode, window size and hidden input

use std::io::{self, BufRead, IsTerminal, Write};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Size used when stdout is not a terminal
pub const FALLBACK_COLS: u32 = 80;
pub const FALLBACK_ROWS: u32 = 24;

#[cfg(unix)]
mod sys {
    nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, nix::libc::winsize);
}

/// Puts stdin into raw mode and restores the saved settings on drop.
///
/// Inert when stdin is not a terminal.
pub struct RawModeGuard {
    #[cfg(unix)]
    original: Option<nix::sys::termios::Termios>,
}

impl RawModeGuard {
    #[cfg(unix)]
    pub fn enter() -> io::Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a terminal, raw mode skipped");
            return Ok(Self { original: None });
        }

        let original = tcgetattr(&stdin)?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        debug!("Terminal switched to raw mode");

        Ok(Self {
            original: Some(original),
        })
    }

    #[cfg(not(unix))]
    pub fn enter() -> io::Result<Self> {
        Ok(Self {})
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::termios::{tcsetattr, SetArg};

            if let Some(original) = self.original.take() {
                if let Err(e) = tcsetattr(io::stdin(), SetArg::TCSANOW, &original) {
                    warn!("Failed to restore terminal settings: {}", e);
                } else {
                    debug!("Terminal settings restored");
                }
            }
        }
    }
}

/// Current (cols, rows) of the controlling terminal, 80x24 when unknown
pub fn terminal_size() -> (u32, u32) {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;

        let stdout = io::stdout();
        if stdout.is_terminal() {
            let mut size = nix::libc::winsize {
                ws_row: 0,
                ws_col: 0,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            // SAFETY: the fd is valid for the lifetime of `stdout` and `size`
            // is a properly sized winsize the ioctl writes into.
            let result = unsafe { sys::tiocgwinsz(stdout.as_raw_fd(), &mut size) };
            if result.is_ok() && size.ws_col > 0 && size.ws_row > 0 {
                return (u32::from(size.ws_col), u32::from(size.ws_row));
            }
        }
    }
    (FALLBACK_COLS, FALLBACK_ROWS)
}

/// Forward SIGWINCH as new terminal sizes until `token` is cancelled.
/// Returns `None` where window-change signals do not exist.
pub fn spawn_resize_watcher(
    token: CancellationToken,
) -> Option<(mpsc::Receiver<(u32, u32)>, JoinHandle<()>)> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut winch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGWINCH handler: {}", e);
                return None;
            }
        };
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = winch.recv() => {
                        if received.is_none() {
                            break;
                        }
                        if tx.send(terminal_size()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Resize watcher finished");
        });

        Some((rx, task))
    }

    #[cfg(not(unix))]
    {
        let _ = token;
        None
    }
}

/// Print `prompt` on stderr and read one line from stdin with echo off.
/// End of input is an `UnexpectedEof` error.
pub fn read_hidden_line(prompt: &str) -> io::Result<Zeroizing<String>> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    let _echo = EchoOff::enter()?;
    let line = read_line(&mut io::stdin().lock());
    writeln!(stderr)?;
    line
}

/// Read one line, without its line terminator
pub fn read_line<R: BufRead>(input: &mut R) -> io::Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no input available",
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

struct EchoOff {
    #[cfg(unix)]
    original: Option<nix::sys::termios::Termios>,
}

impl EchoOff {
    #[cfg(unix)]
    fn enter() -> io::Result<Self> {
        use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(Self { original: None });
        }

        let original = tcgetattr(&stdin)?;
        let mut hidden = original.clone();
        hidden.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&stdin, SetArg::TCSANOW, &hidden)?;

        Ok(Self {
            original: Some(original),
        })
    }

    #[cfg(not(unix))]
    fn enter() -> io::Result<Self> {
        Ok(Self {})
    }
}

impl Drop for EchoOff {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::termios::{tcsetattr, SetArg};

            if let Some(original) = self.original.take() {
                if let Err(e) = tcsetattr(io::stdin(), SetArg::TCSANOW, &original) {
                    warn!("Failed to restore terminal echo: {}", e);
                }
            }
        }
    }
}
