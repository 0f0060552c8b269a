//! Optional `--bind`: ties the supervisor's lifetime to the operator's
//! `systemd-logind`/`elogind` session, per spec.md's event-loop step 7
//! ("Bind-to-session (optional): on FD ready, flush the monitor, query
//! session count; if zero, synthesize a TERM").
//!
//! `original_source/daemon/daemon.c` does this through `sd_login_monitor_new`,
//! a thin libsystemd wrapper around an `inotify` watch on logind's runtime
//! state directory. We watch the same directory directly with `nix`'s
//! `inotify` wrapper (the crate this repo already leans on for every other
//! raw-syscall need) rather than link libsystemd, and read session counts
//! from `/run/systemd/users/<uid>`'s `SESSIONS=` line, the same file
//! `sd_uid_get_sessions(3)` parses.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tracing::warn;

const LOGIND_USERS_DIR: &str = "/run/systemd/users";

pub struct SessionMonitor {
    inotify: Inotify,
    uid: u32,
}

/// Sets up the monitor if `/run/systemd/users` exists (logind/elogind is
/// present); returns `None` otherwise so `--bind` degrades to a no-op on
/// systems without a login manager, matching the original's "continuing
/// unbound" fallback on `sd_login_monitor_new` failure.
pub fn init(uid: u32) -> Option<SessionMonitor> {
    if !std::path::Path::new(LOGIND_USERS_DIR).is_dir() {
        warn!("--bind given but {LOGIND_USERS_DIR} is absent; continuing unbound");
        return None;
    }
    let inotify = match Inotify::init(InitFlags::IN_NONBLOCK) {
        Ok(i) => i,
        Err(e) => {
            warn!("failed to init session monitor (continuing unbound): {e}");
            return None;
        }
    };
    let flags = AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_DELETE_SELF;
    if let Err(e) = inotify.add_watch(LOGIND_USERS_DIR, flags) {
        warn!("failed to watch {LOGIND_USERS_DIR} (continuing unbound): {e}");
        return None;
    }
    Some(SessionMonitor { inotify, uid })
}

impl SessionMonitor {
    pub fn as_raw_fd(&self) -> RawFd {
        self.inotify.as_raw_fd()
    }

    /// Drains pending inotify events without interpreting them: any event on
    /// the watched directory is itself the trigger to re-check the session
    /// count, so their content doesn't matter (mirrors "flush the monitor").
    pub fn drain(&self) {
        loop {
            match self.inotify.read_events() {
                Ok(events) if events.is_empty() => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("session monitor read failed: {e}");
                    break;
                }
            }
        }
    }

    /// Number of active sessions for this uid, per the `SESSIONS=` line of
    /// `/run/systemd/users/<uid>`. Zero if the file is absent (no sessions,
    /// or logind has nothing recorded for this uid).
    pub fn session_count(&self) -> u32 {
        let path = PathBuf::from(LOGIND_USERS_DIR).join(self.uid.to_string());
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = %path.display(), "failed to read logind user state: {e}");
                return 0;
            }
        };
        text.lines()
            .find_map(|line| line.strip_prefix("SESSIONS="))
            .map(|v| v.split_whitespace().count() as u32)
            .unwrap_or(0)
    }
}
