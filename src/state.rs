//! The data model of spec.md §3: a single, owned `Supervisor` record built
//! in `main` and threaded through the subsystems, replacing the original's
//! file-scope global struct (`g`) per the "module-global mutable state"
//! design note in spec.md §9.

use std::path::PathBuf;
use std::time::Duration;

use crate::respawn::RespawnPolicy;

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd_path: PathBuf,
    pub cmd_argv: Vec<String>,
    pub cmd_envv: Option<Vec<String>>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub init_groups: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FsPosture {
    pub chroot_path: Option<PathBuf>,
    pub chdir_path: Option<PathBuf>,
    pub umask: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecMode {
    pub foreground: bool,
    pub pty: bool,
    pub pty_noecho: bool,
}

/// Either a syslog `(facility, priority)` pair or a filesystem path.
#[derive(Debug, Clone)]
pub enum Sink {
    Syslog { facility: String, priority: String },
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SinkSet {
    pub daemon_err: Option<Sink>,
    pub daemon_dbg: Option<Sink>,
    pub client_stdout: Option<Sink>,
    pub client_stderr: Option<Sink>,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    pub exec: ExecSpec,
    pub identity: Identity,
    pub fs: FsPosture,
    pub respawn_flag: bool,
    pub respawn_policy: RespawnPolicy,
    pub idiot_mode: bool,
    pub mode: ExecMode,
    pub sinks: SinkSet,
    pub read_eof: bool,
    pub pidfile_path: Option<PathBuf>,
    pub core_dumps: bool,
    pub unsafe_flag: bool,
    pub safe_flag: bool,
    pub bind_session: bool,
    pub startup_delay: Duration,
}
