//! C9: the top-level sequencing spec.md §4.9 prescribes, tying every other
//! module together. `run` is `main`'s only real logic; everything else in
//! `main.rs` is argv plumbing and exit-code translation.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, error, info, warn};

use crate::cli::Cli;
use crate::config::{self, OptionMap};
use crate::control;
use crate::coproc;
use crate::daemonize;
use crate::expand;
use crate::pidfile::{self, Pidfile};
use crate::respawn::{self, RespawnController, RespawnPolicy};
use crate::safety;
use crate::signals::{self, SignalFlags};
use crate::sinks::{self, SinkWriter};
use crate::state::{ExecMode, ExecSpec, FsPosture, Identity, Sink, SinkSet, Supervisor};

/// Runs the full startup sequence and, for supervision mode, the relay/
/// respawn loop. Returns the process exit code.
pub fn run(cli: Cli) -> anyhow::Result<i32> {
    drop_suid_privilege();

    let real_uid = unsafe { libc::getuid() };

    if let Some(chroot) = &cli.chroot {
        apply_chroot(chroot)?;
    }
    if let Some(user_spec) = &cli.user {
        apply_user(user_spec)?;
    }

    let euid = unsafe { libc::geteuid() };
    let idiot_mode = cli.idiot && real_uid == 0;
    let allow_vars = expand::vars_allowed(real_uid, idiot_mode);

    let config_map = if cli.noconfig {
        OptionMap::new()
    } else {
        let enforce_safety = safety::enforcement_applies(real_uid, cli.unsafe_, cli.safe);
        let paths = match &cli.config {
            Some(p) => vec![p.clone()],
            None => config::default_search_path(home_dir().as_deref()),
        };
        let parsed = config::load_all(&paths, enforce_safety, euid, allow_vars)?;
        parsed.resolved_for(cli.name.as_deref())
    };

    let mut sup = build_supervisor(&cli, &config_map, allow_vars)?;
    sup.idiot_mode = idiot_mode;
    sup.respawn_policy.clamp(idiot_mode);

    sanity_check(&cli, &sup)?;

    if !cli.core {
        disable_core_dumps();
    }

    if let Some(code) = maybe_control_plane(&cli, euid)? {
        return Ok(code);
    }

    let pidfile_path = pidfile::resolve_path(
        cli.pidfile.as_deref(),
        cli.pidfiles.as_deref(),
        sup.exec.name.as_deref(),
        euid,
        home_dir().as_deref(),
    );
    sup.pidfile_path = pidfile_path.clone();

    let pidfile_handle = if sup.mode.foreground {
        match &pidfile_path {
            Some(path) => Some(
                Pidfile::acquire(path, std::process::id() as i32)
                    .with_context(|| format!("{}: failed to acquire pidfile lock", path.display()))?,
            ),
            None => None,
        }
    } else {
        daemonize::daemonize(pidfile_path.as_deref())
    };

    if let Some(path) = sup.fs.chdir_path.clone() {
        std::env::set_current_dir(&path).with_context(|| format!("{}: chdir failed", path.display()))?;
    }
    if let Some(mask) = sup.fs.umask {
        unsafe { libc::umask(mask as libc::mode_t) };
    }

    let mut err_sink = open_sink(&sup.sinks.daemon_err);
    let mut dbg_sink = open_sink(&sup.sinks.daemon_dbg);

    if cli.debug.unwrap_or(0) >= 2 {
        debug!(?sup, "resolved configuration");
    }

    let flags = SignalFlags::new();
    let _signal_ids = unsafe { signals::install(flags.clone()) }.context("failed to install signal handlers")?;

    let title = sup.exec.name.clone().unwrap_or_else(|| sup.exec.cmd_path.to_string_lossy().into_owned());
    crate::proctitle::set(&format!("supervising {title}"));

    let session_monitor = if sup.bind_session { crate::session::init(real_uid) } else { None };

    let exit_code = run_loop(&sup, &title, &flags, &mut err_sink, &mut dbg_sink, session_monitor.as_ref());

    crate::proctitle::restore();

    if let Some(pf) = pidfile_handle {
        pf.unlink();
    }

    Ok(exit_code)
}

fn drop_suid_privilege() {
    unsafe {
        let ruid = libc::getuid();
        let rgid = libc::getgid();
        if libc::getegid() != rgid {
            libc::setgid(rgid);
        }
        if libc::geteuid() != ruid {
            libc::setuid(ruid);
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn apply_chroot(path: &Path) -> anyhow::Result<()> {
    std::env::set_current_dir(path).with_context(|| format!("{}: chdir failed", path.display()))?;
    let c = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| anyhow!("{}: chroot path contains NUL", path.display()))?;
    if unsafe { libc::chroot(c.as_ptr()) } != 0 {
        bail!("{}: chroot failed: {}", path.display(), std::io::Error::last_os_error());
    }
    std::env::set_current_dir("/").context("chdir(/) after chroot failed")?;
    Ok(())
}

/// Resolves `USER[:[GROUP]]` / `USER[.[GROUP]]`. Per the original's
/// documented ambiguity rule (spec.md §9, reproduced verbatim): `:` is
/// always treated as the user/group separator, while `.` is treated as a
/// separator only if it appears in the string and the substring before it
/// names a valid user -- otherwise a `.` is assumed to be part of the
/// username itself (some usernames legitimately contain dots).
fn apply_user(spec: &str) -> anyhow::Result<()> {
    let (user, group) = split_user_spec(spec);
    let uid = lookup_uid(&user).ok_or_else(|| anyhow!("{user}: no such user"))?;
    let gid = match &group {
        Some(g) if !g.is_empty() => lookup_gid(g).ok_or_else(|| anyhow!("{g}: no such group"))?,
        _ => lookup_primary_gid(&user).ok_or_else(|| anyhow!("{user}: could not determine primary group"))?,
    };

    if unsafe { libc::initgroups(CString::new(user.as_str()).unwrap().as_ptr(), gid) } != 0 {
        warn!("initgroups failed: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::setgid(gid) } != 0 {
        bail!("setgid({gid}) failed: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        bail!("setuid({uid}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn split_user_spec(spec: &str) -> (String, Option<String>) {
    if let Some((u, g)) = spec.split_once(':') {
        return (u.to_string(), Some(g.to_string()));
    }
    if let Some((u, g)) = spec.split_once('.') {
        if lookup_uid(u).is_some() {
            return (u.to_string(), Some(g.to_string()));
        }
    }
    (spec.to_string(), None)
}

fn lookup_uid(user: &str) -> Option<u32> {
    let cuser = CString::new(user).ok()?;
    let pwd = unsafe { libc::getpwnam(cuser.as_ptr()) };
    if pwd.is_null() {
        None
    } else {
        Some(unsafe { (*pwd).pw_uid })
    }
}

fn lookup_primary_gid(user: &str) -> Option<u32> {
    let cuser = CString::new(user).ok()?;
    let pwd = unsafe { libc::getpwnam(cuser.as_ptr()) };
    if pwd.is_null() {
        None
    } else {
        Some(unsafe { (*pwd).pw_gid })
    }
}

fn lookup_gid(group: &str) -> Option<u32> {
    let cgroup = CString::new(group).ok()?;
    let grp = unsafe { libc::getgrnam(cgroup.as_ptr()) };
    if grp.is_null() {
        None
    } else {
        Some(unsafe { (*grp).gr_gid })
    }
}

fn disable_core_dumps() {
    let rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };
}

fn str_opt(cli_val: &Option<String>, config: &OptionMap, key: &str) -> Option<String> {
    cli_val.clone().or_else(|| config.get(key).cloned().flatten())
}

fn path_opt(cli_val: &Option<PathBuf>, config: &OptionMap, key: &str) -> Option<PathBuf> {
    cli_val
        .clone()
        .or_else(|| config.get(key).cloned().flatten().map(PathBuf::from))
}

fn bool_opt(cli_val: bool, config: &OptionMap, key: &str) -> bool {
    cli_val || config.contains_key(key)
}

fn num_opt<T: std::str::FromStr>(cli_val: Option<T>, config: &OptionMap, key: &str) -> Option<T> {
    cli_val.or_else(|| config.get(key).cloned().flatten().and_then(|s| s.parse().ok()))
}

fn build_supervisor(cli: &Cli, config: &OptionMap, allow_vars: bool) -> anyhow::Result<Supervisor> {
    let name = cli.name.clone();

    let (cmd_path, cmd_argv) = resolve_command(cli)?;

    let respawn_flag = bool_opt(cli.respawn, config, "respawn");
    let mut policy = RespawnPolicy::default();
    if let Some(v) = num_opt(cli.acceptable, config, "acceptable") {
        policy.acceptable = Duration::from_secs(v);
    }
    if let Some(v) = num_opt(cli.attempts, config, "attempts") {
        policy.attempts_max = v;
    }
    if let Some(v) = num_opt(cli.delay, config, "delay") {
        policy.delay = Duration::from_secs(v);
    }
    if let Some(v) = num_opt(cli.limit, config, "limit") {
        policy.limit_bursts = v;
    }

    let foreground = bool_opt(cli.foreground, config, "foreground");
    let pty_spec = str_opt(&cli.pty, config, "pty");
    let pty = pty_spec.is_some() || config.contains_key("pty");
    let pty_noecho = pty_spec.as_deref() == Some("noecho");

    let umask = str_opt(&cli.umask, config, "umask")
        .map(|s| u32::from_str_radix(&s, 8))
        .transpose()
        .context("invalid --umask value")?;
    let chdir_path = path_opt(&cli.chdir, config, "chdir");

    let errlog = str_opt(&cli.errlog, config, "errlog").map(|s| sinks::parse_sink_spec(&expand::expand(&s, allow_vars)));
    let dbglog = str_opt(&cli.dbglog, config, "dbglog").map(|s| sinks::parse_sink_spec(&expand::expand(&s, allow_vars)));
    let output = str_opt(&cli.output, config, "output").map(|s| sinks::parse_sink_spec(&expand::expand(&s, allow_vars)));
    let stdout_sink = str_opt(&cli.stdout, config, "stdout")
        .map(|s| sinks::parse_sink_spec(&expand::expand(&s, allow_vars)))
        .or_else(|| output.clone());
    let stderr_sink = str_opt(&cli.stderr, config, "stderr")
        .map(|s| sinks::parse_sink_spec(&expand::expand(&s, allow_vars)))
        .or(output);

    let read_eof = !bool_opt(cli.ignore_eof, config, "ignore-eof") || bool_opt(cli.read_eof, config, "read-eof");

    let mut cmd_envv = if cli.inherit || config.contains_key("inherit") {
        Some(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>())
    } else {
        None
    };
    for kv in &cli.env {
        let expanded = expand::expand(kv, allow_vars);
        cmd_envv.get_or_insert_with(Vec::new).push(expanded);
    }

    Ok(Supervisor {
        exec: ExecSpec {
            cmd_path,
            cmd_argv,
            cmd_envv,
            name,
        },
        identity: Identity::default(),
        fs: FsPosture {
            chroot_path: cli.chroot.clone(),
            chdir_path,
            umask,
        },
        respawn_flag,
        respawn_policy: policy,
        idiot_mode: false,
        mode: ExecMode {
            foreground,
            pty,
            pty_noecho,
        },
        sinks: SinkSet {
            daemon_err: errlog,
            daemon_dbg: dbglog,
            client_stdout: stdout_sink,
            client_stderr: stderr_sink,
        },
        read_eof,
        pidfile_path: None,
        core_dumps: cli.core,
        unsafe_flag: cli.unsafe_,
        safe_flag: cli.safe,
        bind_session: cli.bind,
        startup_delay: Duration::ZERO,
    })
}

fn resolve_command(cli: &Cli) -> anyhow::Result<(PathBuf, Vec<String>)> {
    let (cmd, argv) = if let Some(command) = &cli.command {
        let mut parts = command.split_whitespace();
        let cmd = parts.next().ok_or_else(|| anyhow!("--command given an empty string"))?.to_string();
        let rest: Vec<String> = parts.map(|s| s.to_string()).chain(cli.cmd_argv.iter().cloned()).collect();
        (cmd, rest)
    } else {
        let mut it = cli.cmd_argv.iter().cloned();
        let cmd = it.next().ok_or_else(|| anyhow!("no command given"))?;
        (cmd, it.collect())
    };

    Ok((PathBuf::from(cmd), argv))
}

fn sanity_check(cli: &Cli, sup: &Supervisor) -> anyhow::Result<()> {
    if (cli.acceptable.is_some() || cli.attempts.is_some() || cli.delay.is_some() || cli.limit.is_some())
        && !sup.respawn_flag
    {
        bail!("--acceptable/--attempts/--delay/--limit require --respawn");
    }
    if sup.mode.pty && !sup.mode.foreground {
        bail!("--pty requires --foreground");
    }
    let control_flags = [cli.running, cli.restart, cli.stop, cli.signal.is_some(), cli.list];
    if control_flags.iter().filter(|b| **b).count() > 1 {
        bail!("control-plane options are mutually exclusive");
    }
    if (cli.running || cli.restart || cli.stop || cli.signal.is_some()) && sup.exec.name.is_none() {
        bail!("control-plane operations require --name");
    }
    if cli.unsafe_ && cli.safe {
        bail!("--unsafe and --safe are mutually exclusive");
    }
    Ok(())
}

fn maybe_control_plane(cli: &Cli, euid: u32) -> anyhow::Result<Option<i32>> {
    let verbose = cli.verbose.is_some();

    if cli.list {
        let dir = cli
            .pidfiles
            .clone()
            .unwrap_or_else(|| pidfile::default_pid_dir(euid).to_path_buf());
        let entries = control::list_pidfiles(&dir).unwrap_or_default();
        for (name, path) in entries {
            let status = control::probe_running(&path).unwrap_or(control::RunningStatus::NotRunning);
            if verbose {
                println!("{}", control::format_running(&name, &status));
            }
        }
        return Ok(Some(0));
    }

    if !(cli.running || cli.restart || cli.stop || cli.signal.is_some()) {
        return Ok(None);
    }

    let name = cli.name.as_deref().ok_or_else(|| anyhow!("control-plane operations require --name"))?;
    let path = pidfile::resolve_path(cli.pidfile.as_deref(), cli.pidfiles.as_deref(), Some(name), euid, home_dir().as_deref())
        .ok_or_else(|| anyhow!("could not resolve pidfile path"))?;

    if cli.running {
        let status = control::probe_running(&path)?;
        if verbose {
            println!("{}", control::format_running(name, &status));
        }
        return Ok(Some(if matches!(status, control::RunningStatus::NotRunning) { 1 } else { 0 }));
    }
    if cli.stop {
        control::stop(&path).with_context(|| format!("{name}: stop failed"))?;
        return Ok(Some(0));
    }
    if cli.restart {
        control::restart(&path).with_context(|| format!("{name}: restart failed"))?;
        return Ok(Some(0));
    }
    if let Some(signame) = &cli.signal {
        control::signal_client(&path, signame).with_context(|| format!("{name}: signal failed"))?;
        return Ok(Some(0));
    }
    unreachable!()
}

fn open_sink(sink: &Option<Sink>) -> Option<SinkWriter> {
    sink.as_ref().and_then(|s| match SinkWriter::open(s) {
        Ok(w) => Some(w),
        Err(e) => {
            error!("failed to open sink: {e}");
            None
        }
    })
}

/// Steps 17 onward: spawn, relay, reap, and (with `--respawn`) loop.
fn run_loop(
    sup: &Supervisor,
    title: &str,
    flags: &std::sync::Arc<SignalFlags>,
    err_sink: &mut Option<SinkWriter>,
    dbg_sink: &mut Option<SinkWriter>,
    session_monitor: Option<&crate::session::SessionMonitor>,
) -> i32 {
    let mut controller = RespawnController::new(sup.respawn_policy);
    let mut stdout_sink = open_sink(&sup.sinks.client_stdout);
    let mut stderr_sink = open_sink(&sup.sinks.client_stderr);

    // The argv[0] the client sees as its own name: "name: original" when
    // --name is given, otherwise the command string itself. Kept separate
    // from the path actually passed to execve (resolve_argv below).
    let argv0 = match &sup.exec.name {
        Some(name) => format!("{name}: {}", sup.exec.cmd_path.to_string_lossy()),
        None => sup.exec.cmd_path.to_string_lossy().into_owned(),
    };

    loop {
        if flags.is_terminated() {
            return 0;
        }

        let outcome = controller.prepare_spawn(flags, |dur| sleep_checking_term(flags, dur));
        match outcome {
            respawn::Outcome::GaveUp => {
                log_err(err_sink, "gave up after repeated rapid failures");
                return 1;
            }
            respawn::Outcome::Terminated => return 0,
            respawn::Outcome::Proceed => {}
        }

        if flags.take_usr1() {
            controller.reset_on_usr1();
        }

        let (exec_path, argv) = match coproc::resolve_argv(
            &coproc::classify(&sup.exec.cmd_path.to_string_lossy(), &sup.exec.cmd_argv),
            unsafe { libc::geteuid() },
            &argv0,
        ) {
            Ok(a) => a,
            Err(e) => {
                log_err(err_sink, &format!("failed to resolve client command: {e}"));
                return 1;
            }
        };

        let spawn_result = if sup.mode.pty {
            unsafe {
                coproc::spawn_pty(
                    &exec_path,
                    &argv,
                    sup.exec.cmd_envv.as_deref(),
                    None,
                    None,
                    sup.mode.pty_noecho,
                    signals::reset_to_default_in_child,
                )
            }
            .map(ChildHandle::Pty)
        } else {
            unsafe { coproc::spawn_pipe(&exec_path, &argv, sup.exec.cmd_envv.as_deref(), signals::reset_to_default_in_child) }
                .map(ChildHandle::Pipe)
        };

        let child = match spawn_result {
            Ok(c) => c,
            Err(e) => {
                log_err(err_sink, &format!("failed to exec client: {e}"));
                return 1;
            }
        };

        let child_pid = child.pid();
        flags.set_child_pid(child_pid);
        if let Some(path) = &sup.pidfile_path {
            let _ = pidfile::write_clientpid(&pidfile::clientpid_path(path), child_pid);
        }
        info!(pid = child_pid, "client started");
        crate::proctitle::set(&format!("{title}: running (pid {child_pid})"));

        let status = pump_and_reap(sup, flags, &child, &mut stdout_sink, &mut stderr_sink, dbg_sink, session_monitor);
        flags.set_child_pid(0);
        if let Some(path) = &sup.pidfile_path {
            pidfile::unlink_clientpid(&pidfile::clientpid_path(path));
        }

        classify_exit(dbg_sink, child_pid, status);

        if flags.is_terminated() {
            return 0;
        }
        if !sup.respawn_flag {
            return exit_code_of(status);
        }
    }
}

enum ChildHandle {
    Pipe(coproc::PipeChild),
    Pty(coproc::PtyChild),
}

impl ChildHandle {
    fn pid(&self) -> i32 {
        match self {
            ChildHandle::Pipe(c) => c.pid,
            ChildHandle::Pty(c) => c.pid,
        }
    }
}

fn sleep_checking_term(flags: &SignalFlags, dur: Duration) -> bool {
    let deadline = std::time::Instant::now() + dur;
    while std::time::Instant::now() < deadline {
        if flags.is_terminated() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100).min(deadline - std::time::Instant::now()));
    }
    flags.is_terminated()
}

fn pump_and_reap(
    sup: &Supervisor,
    flags: &SignalFlags,
    child: &ChildHandle,
    stdout_sink: &mut Option<SinkWriter>,
    stderr_sink: &mut Option<SinkWriter>,
    _dbg_sink: &mut Option<SinkWriter>,
    session_monitor: Option<&crate::session::SessionMonitor>,
) -> libc::c_int {
    use crate::relay::{step, RelayConfig, RelayInputs, StepResult};
    use std::os::fd::{AsFd, BorrowedFd};

    let mut stdin_eof = !sup.mode.foreground;
    let (pty_fd, pipe_out_fd, pipe_err_fd, pipe_in_fd) = match child {
        ChildHandle::Pty(c) => (Some(c.master_fd.as_fd()), None, None, Some(c.master_fd.as_fd())),
        ChildHandle::Pipe(c) => (
            None,
            Some(c.stdout_fd.as_fd()),
            Some(c.stderr_fd.as_fd()),
            c.stdin_fd.as_ref().map(|f| f.as_fd()),
        ),
    };
    let stdin_fd = if sup.mode.foreground {
        Some(unsafe { std::os::fd::BorrowedFd::borrow_raw(0) })
    } else {
        None
    };

    let session_fd = session_monitor.map(|m| unsafe { BorrowedFd::borrow_raw(m.as_raw_fd()) });

    let mut inputs = RelayInputs {
        stdin: stdin_fd,
        pty_master: pty_fd,
        child_stdout: pipe_out_fd,
        child_stderr: pipe_err_fd,
        session: session_fd,
    };

    loop {
        let mut cfg = RelayConfig {
            foreground: sup.mode.foreground,
            stdout_sink: stdout_sink.as_mut(),
            stderr_sink: stderr_sink.as_mut(),
        };
        let to_child_stdin = pipe_in_fd.map(|f| std::os::fd::AsRawFd::as_raw_fd(&f));
        match step(flags, sup.read_eof, &mut inputs, &mut stdin_eof, to_child_stdin, &mut cfg) {
            Ok(StepResult::Continue) => continue,
            Ok(StepResult::SessionCheck) => {
                if let Some(mon) = session_monitor {
                    mon.drain();
                    if mon.session_count() == 0 {
                        flags.synthesize_term();
                    }
                }
                continue;
            }
            Ok(StepResult::Done) | Ok(StepResult::ReapNow) => break,
            Err(e) => {
                warn!("relay loop error: {e}");
                break;
            }
        }
    }

    reap(child.pid())
}

fn reap(pid: i32) -> libc::c_int {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 {
            return status;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return 0;
        }
    }
}

fn classify_exit(dbg_sink: &mut Option<SinkWriter>, pid: i32, status: libc::c_int) {
    unsafe {
        if libc::WIFEXITED(status) {
            let code = libc::WEXITSTATUS(status);
            log_dbg(dbg_sink, &format!("client {pid} exited with status {code}"));
        } else if libc::WIFSIGNALED(status) {
            let sig = libc::WTERMSIG(status);
            log_dbg(dbg_sink, &format!("client {pid} killed by signal {sig}"));
        } else if libc::WIFSTOPPED(status) {
            warn!(pid, "client stopped unexpectedly (no WUNTRACED requested)");
        }
    }
}

fn exit_code_of(status: libc::c_int) -> i32 {
    unsafe {
        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            1
        }
    }
}

fn log_err(sink: &mut Option<SinkWriter>, msg: &str) {
    error!("{msg}");
    if let Some(s) = sink {
        s.write_chunk(format!("{msg}\n").as_bytes());
    }
}

fn log_dbg(sink: &mut Option<SinkWriter>, msg: &str) {
    info!("{msg}");
    if let Some(s) = sink {
        s.write_chunk(format!("{msg}\n").as_bytes());
    }
}
