//! C3: the UNIX daemonization sequence, adapted from the teacher's
//! `Daemonizing::new`/`fork_and_wait_for_startup` (`src/lib.rs`, now folded
//! into this module) down to the nine ordered steps spec.md §4.3 specifies.
//! The teacher's parent-waits-on-a-pipe readiness protocol and monitor
//! process are dropped: spec.md's sequence has the first-fork parent exit
//! unconditionally and has no separate monitor process (respawn is handled
//! in-process by C6), so that machinery has no counterpart here.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use tracing::{error, info};

use crate::pidfile::Pidfile;

fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    stat.st_mode & libc::S_IFMT == libc::S_IFSOCK
}

/// Step 1: detect whether we were launched by `init` (ppid==1) or by an
/// inetd-style super-server (stdin is a socket). Either implies steps 2-5
/// (ignore SIGHUP, double fork, setsid) are skipped: we're already detached
/// or already supervised by something that owns our session.
fn already_detached() -> bool {
    unsafe { libc::getppid() == 1 } || is_socket(libc::STDIN_FILENO)
}

fn xfork() -> io::Result<Option<i32>> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        Err(io::Error::last_os_error())
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

fn close_standard_fds() -> io::Result<()> {
    let devnull = CString::new("/dev/null").unwrap();
    let fd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    for target in 0..=2 {
        unsafe { libc::dup2(fd, target) };
    }
    if fd > 2 {
        unsafe { libc::close(fd) };
    }
    Ok(())
}

/// Closes every inherited descriptor above stderr, leaving 0/1/2 (and, if
/// we were inetd-launched, whatever fd the super-server socket uses --
/// those are never in this range for the common case of stdin/stdout/stderr
/// being the socket itself, so no extra bookkeeping is required here).
fn close_inherited_fds() {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd < 0 { 1024 } else { max_fd };
    for fd in 3..max_fd as RawFd {
        unsafe { libc::close(fd) };
    }
}

/// Runs the daemonization sequence and installs the pidfile lock,
/// returning once running as the detached daemon process. Exits the
/// process directly on any fatal step, per spec.md §4.3/§7 ("failed
/// daemonize" is one of the few things the supervisor dies for).
pub fn daemonize(pidfile_path: Option<&Path>) -> Option<Pidfile> {
    let inherited_session = already_detached();

    if !inherited_session {
        unsafe { libc::signal(libc::SIGHUP, libc::SIG_IGN) };

        match xfork() {
            Ok(Some(_child)) => {
                maybe_startup_delay();
                std::process::exit(0);
            }
            Ok(None) => {}
            Err(e) => {
                error!("first fork failed: {e}");
                std::process::exit(1);
            }
        }

        if unsafe { libc::setsid() } < 0 {
            error!("setsid failed: {}", io::Error::last_os_error());
            std::process::exit(1);
        }

        match xfork() {
            Ok(Some(_child)) => std::process::exit(0),
            Ok(None) => {}
            Err(e) => {
                error!("second fork failed: {e}");
                std::process::exit(1);
            }
        }
    }

    if std::env::set_current_dir("/").is_err() {
        error!("chdir(/) failed: {}", io::Error::last_os_error());
        std::process::exit(1);
    }
    unsafe { libc::umask(0) };

    if !inherited_session {
        close_inherited_fds();
        if let Err(e) = close_standard_fds() {
            error!("failed to reopen stdio on /dev/null: {e}");
            std::process::exit(1);
        }
    }

    match pidfile_path {
        Some(path) => match Pidfile::acquire(path, std::process::id() as i32) {
            Ok(pf) => Some(pf),
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },
        None => None,
    }
}

/// Honors `DAEMON_STARTUP_DELAY_MS`, an undocumented knob retained for
/// parity with the original's 0.4s desktop-bus workaround (see DESIGN.md).
/// Called from the first-fork parent right before its `exit(0)`, since the
/// original delays the termination of the initial process, not the
/// already-detached child.
fn maybe_startup_delay() {
    if let Ok(val) = std::env::var("DAEMON_STARTUP_DELAY_MS") {
        if let Ok(ms) = val.parse::<u64>() {
            info!(ms, "honoring startup delay");
            std::thread::sleep(std::time::Duration::from_millis(ms));
        }
    }
}

