//! C5: the async-signal-safe signal router.
//!
//! Generalizes the teacher's use of `signal_hook` (previously only for the
//! `Cleanup` fatal-signal thread in `cleanup.rs`) to install handlers that
//! touch nothing but lock-free atomics, per spec.md §4.5 and the "signal
//! handler flag protocol" design note in §9: policy decisions (forwarding
//! `TERM`, resetting respawn counters on `USR1`) all happen later, in the
//! main loop, between `select` calls -- the handler itself only sets a flag
//! and, for `TERM`/`USR1`, calls `kill()` on a pid read from an atomic.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use libc::c_int;

/// Shared, process-wide signal state. The one legitimate global the design
/// notes call for: signal handlers need access to it and nothing else does
/// except through the synchronous dispatch point in the event loop.
#[derive(Default)]
pub struct SignalFlags {
    pub terminated: AtomicBool,
    pub received_sigchld: AtomicBool,
    pub usr1_requested: AtomicBool,
    /// 0 means "no child". Updated by the main loop, read by handlers.
    pub child_pid: AtomicI32,
}

impl SignalFlags {
    pub fn new() -> Arc<SignalFlags> {
        Arc::new(SignalFlags::default())
    }

    pub fn set_child_pid(&self, pid: i32) {
        self.child_pid.store(pid, Ordering::SeqCst);
    }

    pub fn take_sigchld(&self) -> bool {
        self.received_sigchld.swap(false, Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn take_usr1(&self) -> bool {
        self.usr1_requested.swap(false, Ordering::SeqCst)
    }

    /// Forwards `SIGTERM` to the current child and marks the supervisor
    /// terminated, exactly as the `SIGTERM` handler itself would -- used by
    /// the main loop (not a signal handler) to synthesize a TERM when the
    /// bound logind session ends (spec.md's event-loop step 7).
    pub fn synthesize_term(&self) {
        forward_to_child(self, libc::SIGTERM);
        self.terminated.store(true, Ordering::SeqCst);
    }
}

fn forward_to_child(flags: &SignalFlags, signo: c_int) {
    let pid = flags.child_pid.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, signo);
        }
    }
}

/// Installs the TERM/CHLD/USR1 handlers. Returns guards that must be kept
/// alive for the handlers to remain effective (dropping a guard restores the
/// previous behavior, mirroring `signal_hook`'s own API).
///
/// # Safety
/// Must be called before any additional threads are started, and the
/// closures passed to `signal_hook::low_level::register` must remain
/// restricted to the async-signal-safe operations documented above.
pub unsafe fn install(flags: Arc<SignalFlags>) -> std::io::Result<Vec<signal_hook::SigId>> {
    let mut ids = Vec::with_capacity(3);

    let f = flags.clone();
    ids.push(signal_hook::low_level::register(libc::SIGTERM, move || {
        forward_to_child(&f, libc::SIGTERM);
        f.terminated.store(true, Ordering::SeqCst);
    })?);

    let f = flags.clone();
    ids.push(signal_hook::low_level::register(libc::SIGCHLD, move || {
        f.received_sigchld.store(true, Ordering::SeqCst);
    })?);

    let f = flags.clone();
    ids.push(signal_hook::low_level::register(libc::SIGUSR1, move || {
        forward_to_child(&f, libc::SIGTERM);
        f.usr1_requested.store(true, Ordering::SeqCst);
    })?);

    Ok(ids)
}

/// Installs the WINCH handler, active only while a PTY is in use and stdin
/// is a terminal. Mirrors stdin's winsize onto the PTY master via ioctl,
/// exactly as the handler itself would (both calls are async-signal-safe).
///
/// # Safety
/// Same constraints as [`install`].
pub unsafe fn install_winch(pty_master_fd: i32) -> std::io::Result<signal_hook::SigId> {
    signal_hook::low_level::register(libc::SIGWINCH, move || {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws as *mut _) == 0 {
            libc::ioctl(pty_master_fd, libc::TIOCSWINSZ, &ws as *const _);
        }
    })
}

/// Children must reset the signal handlers to default before exec --
/// `prepare_child`'s one required duty per spec.md §4.5.
pub fn reset_to_default_in_child() {
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        libc::signal(libc::SIGUSR1, libc::SIG_DFL);
        libc::signal(libc::SIGWINCH, libc::SIG_DFL);
        libc::signal(libc::SIGHUP, libc::SIG_DFL);
    }
}
