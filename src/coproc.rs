//! C4: fork/exec of the client, either over pipes or over a pseudo-terminal
//! pair.
//!
//! The exec-mode classification follows the tagged-union shape the design
//! notes (spec.md §9) prescribe for the original's "does the command contain
//! shell metacharacters" scan, and PTY allocation uses the `nix` crate
//! (grounded in `other_examples`' `ptyprocess` and `portable-pty`, neither of
//! which the teacher needed since it never execs a client with a controlling
//! terminal).

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::ForkResult;

use crate::safety;

const SHELL_METACHARACTERS: &str = "|&;()<>[]{}$`'~\"*? \t\r\n\\";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecPlan {
    /// `cmd` contains `/`: exec it directly.
    Direct { path: String, argv: Vec<String> },
    /// A bare name to search for on `$PATH`.
    PathSearch { name: String, argv: Vec<String> },
    /// Contains shell metacharacters (or direct/path-search exec failed with
    /// `ENOEXEC`): run through `/bin/sh -c`.
    Shell { cmdline: String, extra_argv: Vec<String> },
}

/// Classifies `cmd`/`argv` per spec.md §4.4: shell metacharacters route
/// through `/bin/sh -c`; otherwise `/` routes to a direct exec, and a bare
/// name routes to a `$PATH` search.
pub fn classify(cmd: &str, argv: &[String]) -> ExecPlan {
    if cmd.chars().any(|c| SHELL_METACHARACTERS.contains(c)) {
        return ExecPlan::Shell {
            cmdline: cmd.to_string(),
            extra_argv: argv.to_vec(),
        };
    }
    if cmd.contains('/') {
        ExecPlan::Direct {
            path: cmd.to_string(),
            argv: argv.to_vec(),
        }
    } else {
        ExecPlan::PathSearch {
            name: cmd.to_string(),
            argv: argv.to_vec(),
        }
    }
}

/// Resolves a [`ExecPlan`] to the real executable path (the `execve(2)`
/// filename argument) and the argv array to hand the client, with `argv[0]`
/// set to `argv0` rather than the path itself -- mirroring the original's
/// split between `g.cmdpath` (resolved separately, used only to find and
/// exec the file) and `g.cmd[0]` (the client-visible display name, rewritten
/// to `"name: original"` by the caller when `--name` is given). Keeping these
/// separate means the name rewrite can never change what file actually gets
/// executed.
pub fn resolve_argv(plan: &ExecPlan, euid: u32, argv0: &str) -> io::Result<(String, Vec<String>)> {
    match plan {
        ExecPlan::Direct { path, argv } => {
            let mut v = vec![argv0.to_string()];
            v.extend(argv.iter().cloned());
            Ok((path.clone(), v))
        }
        ExecPlan::PathSearch { name, argv } => match safety::search_path(name, euid)? {
            Some(p) => {
                let mut v = vec![argv0.to_string()];
                v.extend(argv.iter().cloned());
                Ok((p.to_string_lossy().into_owned(), v))
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, format!("{name}: not found"))),
        },
        ExecPlan::Shell { cmdline, extra_argv } => {
            let mut v = vec!["/bin/sh".to_string(), "-c".to_string(), cmdline.clone()];
            v.extend(extra_argv.iter().cloned());
            Ok(("/bin/sh".to_string(), v))
        }
    }
}

fn to_cstrings(argv: &[String]) -> Vec<CString> {
    argv.iter().map(|s| CString::new(s.as_str()).unwrap()).collect()
}

/// `execve`s `path` with `argv` (whose `argv[0]` may differ from `path` when
/// the client's display name was rewritten) and `envp`, retrying as a
/// `/bin/sh` script invocation on `ENOEXEC` (the fallback described in
/// spec.md §4.4, also covering scripts without a `#!` line). Always goes
/// through `execve` rather than `execvp`: `path` has already been resolved
/// (by `resolve_argv`'s `$PATH` search for `PathSearch` plans), so no further
/// lookup by `argv[0]` is wanted or correct once `argv[0]` is a display name.
fn exec_with_enoexec_fallback(path: &str, argv: &[String], envp: Option<&[String]>) -> io::Error {
    let cpath = CString::new(path).unwrap();
    let cargv = to_cstrings(argv);
    let mut argv_ptrs: Vec<*const libc::c_char> = cargv.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let cenv: Option<Vec<CString>> = envp.map(|e| e.iter().map(|s| CString::new(s.as_str()).unwrap()).collect());
    let mut env_ptrs: Vec<*const libc::c_char> = match &cenv {
        Some(v) => v.iter().map(|c| c.as_ptr()).collect(),
        None => vec![],
    };
    env_ptrs.push(std::ptr::null());

    unsafe {
        if cenv.is_some() {
            libc::execve(cpath.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
        } else {
            libc::execve(cpath.as_ptr(), argv_ptrs.as_ptr(), libc::environ as *const *const libc::c_char);
        }
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOEXEC) {
        let mut shell_argv = vec!["/bin/sh".to_string(), path.to_string()];
        shell_argv.extend(argv[1..].iter().cloned());
        let cargv2 = to_cstrings(&shell_argv);
        let mut ptrs2: Vec<*const libc::c_char> = cargv2.iter().map(|c| c.as_ptr()).collect();
        ptrs2.push(std::ptr::null());
        let cshell = CString::new("/bin/sh").unwrap();
        unsafe {
            if cenv.is_some() {
                libc::execve(cshell.as_ptr(), ptrs2.as_ptr(), env_ptrs.as_ptr());
            } else {
                libc::execve(cshell.as_ptr(), ptrs2.as_ptr(), libc::environ as *const *const libc::c_char);
            }
        }
        io::Error::last_os_error()
    } else {
        err
    }
}

pub struct PipeChild {
    pub pid: i32,
    pub stdin_fd: Option<OwnedFd>,
    pub stdout_fd: OwnedFd,
    pub stderr_fd: OwnedFd,
}

/// Spawns `argv` over three pipes, as `coproc_open()` does in the original.
/// `path` is the real file to `execve`; `argv[0]` is only what the client
/// sees as its own name (see [`resolve_argv`]). `prepare_child` runs
/// post-fork, pre-exec, in the child (its one required duty being to reset
/// signal handlers to `SIG_DFL`, see `signals.rs`).
///
/// # Safety
/// Forks the process; only safe to call from a single-threaded program.
pub unsafe fn spawn_pipe(
    path: &str,
    argv: &[String],
    envp: Option<&[String]>,
    prepare_child: impl FnOnce(),
) -> io::Result<PipeChild> {
    let (in_r, in_w) = pipe_pair()?;
    let (out_r, out_w) = pipe_pair()?;
    let (err_r, err_w) = pipe_pair()?;

    match nix::unistd::fork().map_err(io::Error::from)? {
        ForkResult::Child => {
            drop(in_w);
            drop(out_r);
            drop(err_r);
            libc::dup2(in_r.as_raw_fd(), 0);
            libc::dup2(out_w.as_raw_fd(), 1);
            libc::dup2(err_w.as_raw_fd(), 2);
            drop(in_r);
            drop(out_w);
            drop(err_w);

            prepare_child();

            let err = exec_with_enoexec_fallback(path, argv, envp);
            eprintln!("daemon: failed to exec {path}: {err}");
            libc::_exit(127);
        }
        ForkResult::Parent { child } => {
            drop(in_r);
            drop(out_w);
            drop(err_w);
            Ok(PipeChild {
                pid: child.as_raw(),
                stdin_fd: Some(in_w),
                stdout_fd: out_r,
                stderr_fd: err_r,
            })
        }
    }
}

fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

pub struct PtyChild {
    pub pid: i32,
    pub master_fd: OwnedFd,
}

/// Allocates a PTY pair via `nix::pty::openpty` (the only strategy kept in
/// this crate; spec.md §4.4/§9 describe the `/dev/ptmx`, `/dev/ptc`, and BSD
/// scan fallbacks for platforms without `openpty`, which `nix` abstracts
/// away on the Linux target this crate is built for).
///
/// # Safety
/// Forks the process; only safe to call from a single-threaded program.
pub unsafe fn spawn_pty(
    path: &str,
    argv: &[String],
    envp: Option<&[String]>,
    termios: Option<&Termios>,
    winsize: Option<&Winsize>,
    noecho: bool,
    prepare_child: impl FnOnce(),
) -> io::Result<PtyChild> {
    let OpenptyResult { master, slave } = openpty(winsize, termios).map_err(io::Error::from)?;

    // Disable echo on the master side; some kernels default it on.
    if let Ok(mut t) = nix::sys::termios::tcgetattr(&master) {
        t.local_flags.remove(nix::sys::termios::LocalFlags::ECHO);
        let _ = nix::sys::termios::tcsetattr(&master, nix::sys::termios::SetArg::TCSANOW, &t);
    }

    match nix::unistd::fork().map_err(io::Error::from)? {
        ForkResult::Child => {
            drop(master);
            nix::unistd::setsid().ok();

            if noecho {
                if let Ok(mut t) = nix::sys::termios::tcgetattr(&slave) {
                    t.local_flags.remove(nix::sys::termios::LocalFlags::ECHO);
                    let _ = nix::sys::termios::tcsetattr(&slave, nix::sys::termios::SetArg::TCSANOW, &t);
                }
            }

            libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0);
            libc::dup2(slave.as_raw_fd(), 0);
            libc::dup2(slave.as_raw_fd(), 1);
            libc::dup2(slave.as_raw_fd(), 2);
            drop(slave);

            prepare_child();

            let err = exec_with_enoexec_fallback(path, argv, envp);
            eprintln!("daemon: failed to exec {path}: {err}");
            libc::_exit(127);
        }
        ForkResult::Parent { child } => {
            drop(slave);
            Ok(PtyChild {
                pid: child.as_raw(),
                master_fd: master,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_is_path_search() {
        assert!(matches!(classify("sleep", &[]), ExecPlan::PathSearch { .. }));
    }

    #[test]
    fn slash_path_is_direct() {
        assert!(matches!(classify("/bin/sleep", &[]), ExecPlan::Direct { .. }));
    }

    #[test]
    fn metacharacters_force_shell() {
        assert!(matches!(classify("echo hi | cat", &[]), ExecPlan::Shell { .. }));
        assert!(matches!(classify("exit 1", &[]), ExecPlan::Shell { .. }));
    }
}
