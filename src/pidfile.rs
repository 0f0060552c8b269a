//! C2: the pidfile advisory-locking protocol.
//!
//! Adapted from the teacher's `Daemonize::make_pidfile`/`read_pidfile`
//! (`examples/vmware-archive-nerpa/daemon/src/lib.rs`), generalized from a
//! one-shot "refuse if already running" check into the full named-instance
//! lock held for the supervisor's lifetime. `Pidfile::acquire` locks the
//! real pidfile path directly (no tmpfile-then-rename), so the teacher's
//! lock-then-verify-inode race only matters on the read side, where
//! `read_running_pid` backs C8's stale-pidfile detection (spec.md §4.2).

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{DaemonError, Result};

#[cfg(target_os = "linux")]
pub const ROOT_PID_DIR: &str = "/var/run";
#[cfg(target_os = "linux")]
pub const USER_PID_DIR: &str = "/tmp";

/// The default pidfile directory for `euid`, used by `--list`'s directory
/// traversal when no explicit `--pidfiles` directory was given.
pub fn default_pid_dir(euid: u32) -> &'static Path {
    Path::new(if euid == 0 { ROOT_PID_DIR } else { USER_PID_DIR })
}

/// Resolves the pidfile path from the operator's explicit `--pidfile`, an
/// explicit `--pidfiles` directory plus `name`, or the system default.
pub fn resolve_path(
    explicit_pidfile: Option<&Path>,
    pidfiles_dir: Option<&Path>,
    name: Option<&str>,
    euid: u32,
    home_dir: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(p) = explicit_pidfile {
        return Some(p.to_path_buf());
    }
    let name = name?;
    if let Some(dir) = pidfiles_dir {
        return Some(dir.join(format!("{name}.pid")));
    }
    let default_dir = if euid == 0 { ROOT_PID_DIR } else { USER_PID_DIR };
    let path = Path::new(default_dir).join(format!("{name}.pid"));

    // Auto-create the parent directory with 0700, but only under the user's
    // home directory -- never under a system directory.
    if let Some(home) = home_dir {
        if let Some(parent) = path.parent() {
            if parent.starts_with(home) && !parent.exists() {
                let _ = fs::create_dir_all(parent);
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode_compat(0o700));
            }
        }
    }

    Some(path)
}

// `std::fs::Permissions` has no portable "from raw mode" outside unix; keep
// the helper local so callers don't need the unix-only import at their call
// site.
trait PermissionsModeExt {
    fn from_mode_compat(mode: u32) -> fs::Permissions;
}
impl PermissionsModeExt for fs::Permissions {
    fn from_mode_compat(mode: u32) -> fs::Permissions {
        use std::os::unix::fs::PermissionsExt;
        fs::Permissions::from_mode(mode)
    }
}

fn flock_raw(file: &File, cmd: libc::c_int) -> io::Result<libc::flock> {
    let mut lck = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    loop {
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut lck as *mut libc::flock) };
        if ret != -1 {
            return Ok(lck);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn try_set_lock(file: &File) -> io::Result<()> {
    flock_raw(file, libc::F_SETLK)?;
    Ok(())
}

/// Returns `Some(pid)` of the process holding an exclusive lock on `file`,
/// or `None` if the file isn't locked.
fn get_lock_holder(file: &File) -> io::Result<Option<i32>> {
    let lck = flock_raw(file, libc::F_GETLK)?;
    if lck.l_type == libc::F_UNLCK as i16 {
        Ok(None)
    } else {
        Ok(Some(lck.l_pid))
    }
}

/// A locked pidfile, held open for the process's lifetime. Dropping it
/// releases the lock (the OS does this on close/exit regardless); the
/// orchestrator also unlinks the file explicitly so stale unlocked pidfiles
/// don't accumulate.
pub struct Pidfile {
    path: PathBuf,
    file: File,
}

impl Pidfile {
    /// Acquires the lock for `path`, writing `pid` into it. Fails with
    /// `LockContention` if another process already holds the lock.
    pub fn acquire(path: &Path, pid: i32) -> Result<Pidfile> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| DaemonError::syscall(format!("{}: open failed", path.display()), e))?;

        match try_set_lock(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let holder = get_lock_holder(&file).ok().flatten().unwrap_or(-1);
                return Err(DaemonError::LockContention {
                    pidfile: path.to_path_buf(),
                    pid: holder,
                });
            }
            Err(e) => {
                return Err(DaemonError::syscall(
                    format!("{}: fcntl(F_SETLK) failed", path.display()),
                    e,
                ))
            }
        }

        file.set_len(0)
            .map_err(|e| DaemonError::syscall(format!("{}: truncate failed", path.display()), e))?;
        let mut file = file;
        writeln!(file, "{pid}")
            .map_err(|e| DaemonError::syscall(format!("{}: write failed", path.display()), e))?;
        file.flush().ok();

        Ok(Pidfile {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlinks the pidfile. Called from the orchestrator's exit path.
    pub fn unlink(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Reads the PID from `path` without taking the lock, then probes whether
/// the lock is held (a non-blocking shared-lock probe equivalent: attempt
/// `F_GETLK` for an exclusive lock). If nobody holds it, the pidfile is
/// considered stale.
pub fn read_running_pid(path: &Path) -> io::Result<Option<i32>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match get_lock_holder(&file)? {
        None => Ok(None),
        Some(lock_pid) => {
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            reader.read_line(&mut line)?;
            let read_pid: i32 = line
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pidfile"))?;
            if read_pid != lock_pid {
                // Stale: the pid on disk doesn't match whoever holds the lock.
                return Ok(None);
            }
            Ok(Some(lock_pid))
        }
    }
}

/// The path of the `.clientpid` sidecar for a given pidfile path.
pub fn clientpid_path(pidfile_path: &Path) -> PathBuf {
    if pidfile_path.extension().map(|e| e == "pid").unwrap_or(false) {
        pidfile_path.with_extension("clientpid")
    } else {
        let mut s = pidfile_path.as_os_str().to_owned();
        s.push(".clientpid");
        PathBuf::from(s)
    }
}

/// Writes the client pid sidecar (mode 0644, unlocked).
pub fn write_clientpid(path: &Path, pid: i32) -> io::Result<()> {
    let mut file = File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{pid}")
}

pub fn read_clientpid(path: &Path) -> io::Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn unlink_clientpid(path: &Path) {
    let _ = fs::remove_file(path);
}

trait OpenOptionsModeExt {
    fn mode(&mut self, mode: u32) -> &mut Self;
}
impl OpenOptionsModeExt for fs::OpenOptions {
    fn mode(&mut self, mode: u32) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptionsExt::mode(self, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_write_read_roundtrip() {
        let path = std::env::temp_dir().join(format!("daemon-pidfile-test-{}.pid", std::process::id()));
        let _ = fs::remove_file(&path);
        let pf = Pidfile::acquire(&path, 4242).unwrap();
        assert_eq!(read_running_pid(&path).unwrap(), Some(4242));
        pf.unlink();
        assert_eq!(read_running_pid(&path).unwrap(), None);
    }

    #[test]
    fn second_acquire_is_contended() {
        let path = std::env::temp_dir().join(format!("daemon-pidfile-test2-{}.pid", std::process::id()));
        let _ = fs::remove_file(&path);
        let pf = Pidfile::acquire(&path, std::process::id() as i32).unwrap();
        let err = Pidfile::acquire(&path, 1).unwrap_err();
        assert!(matches!(err, DaemonError::LockContention { .. }));
        pf.unlink();
    }

    #[test]
    fn clientpid_path_replaces_extension() {
        let p = Path::new("/tmp/foo.pid");
        assert_eq!(clientpid_path(p), PathBuf::from("/tmp/foo.clientpid"));
    }
}
