//! C7: the single-threaded, `select`-driven I/O relay.
//!
//! Ported from `run()` in `original_source/daemon/daemon.c`: one `select`
//! call per iteration, no user threads, fixed sink delivery order (foreground
//! mirror, then file, then syslog), and a SIGCHLD policy (`read_eof` vs
//! `ignore_eof`) that decides whether to drain remaining output before
//! reaping or reap immediately.

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use tracing::warn;

use crate::signals::SignalFlags;
use crate::sinks::SinkWriter;

const BUF_SIZE: usize = 4096;

pub struct RelayInputs<'a> {
    pub stdin: Option<BorrowedFd<'a>>,
    pub pty_master: Option<BorrowedFd<'a>>,
    pub child_stdout: Option<BorrowedFd<'a>>,
    pub child_stderr: Option<BorrowedFd<'a>>,
    /// The `--bind` session monitor's fd, if session-binding is active.
    pub session: Option<BorrowedFd<'a>>,
}

pub struct RelayConfig<'a> {
    pub foreground: bool,
    pub stdout_sink: Option<&'a mut SinkWriter>,
    pub stderr_sink: Option<&'a mut SinkWriter>,
}

/// Outcome of one pass through the relay loop.
pub enum StepResult {
    /// Keep looping.
    Continue,
    /// All readable sources are closed; move on to reaping.
    Done,
    /// `!read_eof && received_sigchld`: stop pumping, reap now.
    ReapNow,
    /// The session monitor fd is ready; caller should drain it and check
    /// whether the bound session has ended.
    SessionCheck,
}

/// One iteration of the inner relay loop (spec.md §4.7 steps 1-7). Returns
/// as soon as one `select` wakes and its ready fds are drained once.
pub fn step(
    flags: &SignalFlags,
    read_eof: bool,
    inputs: &mut RelayInputs,
    stdin_eof: &mut bool,
    to_child_stdin: Option<RawFd>,
    cfg: &mut RelayConfig,
) -> io::Result<StepResult> {
    if !read_eof && flags.take_sigchld() {
        return Ok(StepResult::ReapNow);
    }

    let has_output = inputs.pty_master.is_some() || inputs.child_stdout.is_some() || inputs.child_stderr.is_some();
    if !has_output {
        return Ok(StepResult::Done);
    }

    let mut readfds = FdSet::new();
    let mut maxfd = -1;
    let mut add = |fd: Option<BorrowedFd>, set: &mut FdSet, maxfd: &mut RawFd| {
        if let Some(fd) = fd {
            set.insert(fd);
            *maxfd = (*maxfd).max(fd.as_raw_fd());
        }
    };
    add(inputs.stdin.filter(|_| !*stdin_eof), &mut readfds, &mut maxfd);
    add(inputs.pty_master, &mut readfds, &mut maxfd);
    add(inputs.child_stdout, &mut readfds, &mut maxfd);
    add(inputs.child_stderr, &mut readfds, &mut maxfd);
    add(inputs.session, &mut readfds, &mut maxfd);

    match select(maxfd + 1, &mut readfds, None, None, None::<&mut TimeVal>) {
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(StepResult::Continue),
        Err(e) => return Err(io::Error::from(e)),
    }

    if flags.take_sigchld() && !read_eof {
        return Ok(StepResult::ReapNow);
    }

    if let Some(fd) = inputs.session {
        if readfds.contains(fd) {
            return Ok(StepResult::SessionCheck);
        }
    }

    let mut buf = [0u8; BUF_SIZE];

    if let Some(fd) = inputs.pty_master {
        if readfds.contains(fd) {
            match read_fd(fd.as_raw_fd(), &mut buf) {
                Ok(0) => inputs.pty_master = None,
                Ok(n) => deliver(&buf[..n], cfg.foreground, true, &mut cfg.stdout_sink),
                Err(e) if would_block_or_intr(&e) => {}
                Err(e) => {
                    warn!("pty read failed: {e}");
                    inputs.pty_master = None;
                }
            }
        }
    }
    if let Some(fd) = inputs.child_stdout {
        if readfds.contains(fd) {
            match read_fd(fd.as_raw_fd(), &mut buf) {
                Ok(0) => inputs.child_stdout = None,
                Ok(n) => deliver(&buf[..n], cfg.foreground, true, &mut cfg.stdout_sink),
                Err(e) if would_block_or_intr(&e) => {}
                Err(e) => {
                    warn!("stdout read failed: {e}");
                    inputs.child_stdout = None;
                }
            }
        }
    }
    if let Some(fd) = inputs.child_stderr {
        if readfds.contains(fd) {
            match read_fd(fd.as_raw_fd(), &mut buf) {
                Ok(0) => inputs.child_stderr = None,
                Ok(n) => deliver(&buf[..n], cfg.foreground, false, &mut cfg.stderr_sink),
                Err(e) if would_block_or_intr(&e) => {}
                Err(e) => {
                    warn!("stderr read failed: {e}");
                    inputs.child_stderr = None;
                }
            }
        }
    }
    if let Some(fd) = inputs.stdin {
        if readfds.contains(fd) {
            let mut b = [0u8; BUF_SIZE];
            match read_fd(fd.as_raw_fd(), &mut b) {
                Ok(0) => {
                    *stdin_eof = true;
                    if let Some(pty) = inputs.pty_master {
                        let veof = [0x04u8]; // ASCII EOT, the common VEOF value.
                        let _ = write_fd(pty.as_raw_fd(), &veof);
                    } else if let Some(cfd) = to_child_stdin {
                        unsafe { libc::close(cfd) };
                    }
                }
                Ok(n) => {
                    let target = inputs.pty_master.map(|f| f.as_raw_fd()).or(to_child_stdin);
                    if let Some(t) = target {
                        let _ = write_fd(t, &b[..n]);
                    }
                }
                Err(e) if would_block_or_intr(&e) => {}
                Err(e) => warn!("stdin read failed: {e}"),
            }
        }
    }

    Ok(StepResult::Continue)
}

fn would_block_or_intr(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Delivers a chunk of output in the fixed order: foreground mirror, then
/// file/syslog sink.
fn deliver(bytes: &[u8], foreground: bool, is_stdout: bool, sink: &mut Option<&mut SinkWriter>) {
    if foreground {
        let mut stream: Box<dyn Write> = if is_stdout {
            Box::new(io::stdout())
        } else {
            Box::new(io::stderr())
        };
        let _ = stream.write_all(bytes);
    }
    if let Some(sink) = sink {
        sink.write_chunk(bytes);
    }
}
