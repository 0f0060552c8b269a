/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

// Derived from tests/daemon.at in Open vSwitch, with the following license:
/*
Copyright (c) 2009, 2010, 2011, 2012, 2013, 2014, 2015 Nicira, Inc.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at:

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;

fn daemon_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_daemon"))
}

fn helper_path() -> &'static str {
    env!("CARGO_BIN_EXE_test-daemon-helper")
}

fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)?,
    }
}

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields Complete(value), then returns Ok(value). After a while, gives up
/// and returns an error instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..14 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn unique_filename(extension: &str) -> Result<PathBuf> {
    static COUNTER: Mutex<usize> = Mutex::new(0);
    let count = {
        let mut counter = COUNTER.lock().unwrap();
        *counter += 1;
        *counter
    };

    let pid = std::process::id();
    let name: PathBuf = std::env::temp_dir().join(format!("daemon-test{pid}.{count}.{extension}"));
    remove_if_exists(&name)?;
    Ok(name)
}

fn pidfile_name() -> Result<PathBuf> {
    unique_filename("pid")
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())?
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn read_pidfile<P: AsRef<Path>>(path: P) -> Result<libc::pid_t> {
    let s = String::from_utf8(std::fs::read(path)?)?;
    Ok(s.trim().parse()?)
}

fn read_pidfile_opt<P: AsRef<Path>>(path: P) -> Option<libc::pid_t> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn wait_until_file_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    wait_until(|| if path.as_ref().exists() { Complete(()) } else { Incomplete })
}

fn check_file_does_not_exist<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::File::open(path.as_ref()) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => Err(anyhow!("{}: expected NotFound, got {other:?}", path.as_ref().display())),
    }
}

fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

/// Waits for `child` to die, and returns its exit status. Use this instead
/// of `wait_for_process_to_die` when `pid` is our own direct child, since a
/// reaped child no longer answers `kill(pid, 0)`.
fn wait_for_child_to_die(child: &mut Child) -> Result<ExitStatus> {
    wait_until(|| match child.try_wait() {
        Ok(Some(status)) => Complete(status),
        Ok(None) => Incomplete,
        Err(_) => Incomplete,
    })
}

fn wait_for_pidfile_to_change<P: AsRef<Path>>(path: P, old_pid: libc::pid_t) -> Result<libc::pid_t> {
    wait_until(|| match read_pidfile_opt(path.as_ref()) {
        Some(new_pid) if new_pid != old_pid => Complete(new_pid),
        _ => Incomplete,
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).try_init();
}

#[test]
fn test_foreground_pidfile_roundtrip() -> Result<()> {
    init_tracing();

    // In foreground mode the supervisor never forks, so the pidfile names
    // our own direct child and the lock is released the instant it exits.
    let pidfile = pidfile_name()?;
    let mut child = daemon_command()
        .arg("--foreground")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .spawn()?;
    let pid = child.id() as libc::pid_t;

    wait_until_file_exists(&pidfile)?;
    assert_eq!(read_pidfile(&pidfile)?, pid);

    send_signal(pid, libc::SIGTERM)?;
    wait_for_child_to_die(&mut child)?;
    check_file_does_not_exist(&pidfile)?;

    Ok(())
}

#[test]
fn test_single_instance_enforcement() -> Result<()> {
    init_tracing();

    // Scenario 4: two concurrent supervisors sharing a pidfile path. Exactly
    // one wins the advisory lock; the loser exits non-zero complaining that
    // the name is already running, and the winner's pidfile still names it.
    let pidfile = pidfile_name()?;
    let mut first = daemon_command()
        .arg("--foreground")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .spawn()?;
    let first_pid = first.id() as libc::pid_t;
    wait_until_file_exists(&pidfile)?;

    let second = daemon_command()
        .arg("--foreground")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .stderr(Stdio::piped())
        .output()
        .context("second instance failed to run")?;

    assert!(!second.status.success());
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("already running"), "unexpected stderr: {stderr}");

    assert_eq!(read_pidfile(&pidfile)?, first_pid);

    send_signal(first_pid, libc::SIGTERM)?;
    wait_for_child_to_die(&mut first)?;
    check_file_does_not_exist(&pidfile)?;

    Ok(())
}

#[test]
fn test_output_capture_to_file() -> Result<()> {
    init_tracing();

    // Scenario 5: a non-respawning client's stdout lands verbatim in the
    // configured sink file, and the supervisor exits with the client's own
    // exit code once it has finished.
    let outfile = unique_filename("out")?;
    let mut child = daemon_command()
        .arg("--foreground")
        .arg("--stdout")
        .arg(&outfile)
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg("echo HELLO")
        .spawn()?;

    let status = wait_for_child_to_die(&mut child)?;
    assert_eq!(status.code(), Some(0));

    let contents = wait_until(|| match std::fs::read_to_string(&outfile) {
        Ok(s) if s.ends_with("HELLO\n") => Complete(s),
        _ => Incomplete,
    })?;
    assert!(contents.ends_with("HELLO\n"), "unexpected output file contents: {contents:?}");

    Ok(())
}

#[test]
fn test_basic_respawn_gives_up_after_one_burst() -> Result<()> {
    init_tracing();

    // Scenario 1 (limit branch): a client that always fails immediately
    // exhausts its attempts within a single burst and, with `--limit=1`,
    // the supervisor gives up instead of sleeping and retrying.
    let pidfile = pidfile_name()?;
    let mut child = daemon_command()
        .arg("--foreground")
        .arg("--respawn")
        .arg("--acceptable=1")
        .arg("--attempts=2")
        .arg("--delay=1")
        .arg("--limit=1")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg("/bin/sh")
        .arg("-c")
        .arg("exit 7")
        .spawn()?;

    let status = wait_for_child_to_die(&mut child)?;
    assert!(!status.success());
    check_file_does_not_exist(&pidfile)?;

    Ok(())
}

#[test]
fn test_respawn_restarts_a_long_lived_client() -> Result<()> {
    init_tracing();

    // A client that outlives `--acceptable` is never charged against the
    // attempt counter; killing it should simply cause a fresh one to start,
    // with a new clientpid and a rewritten greeting file.
    let pidfile = pidfile_name()?;
    let greeting = unique_filename("greeting")?;
    let mut child = daemon_command()
        .arg("--foreground")
        .arg("--respawn")
        .arg("--acceptable=300")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .arg("--greeting-file")
        .arg(&greeting)
        .spawn()?;
    let supervisor_pid = child.id() as libc::pid_t;

    wait_until_file_exists(&greeting)?;
    let clientpid_path = pidfile.with_extension("clientpid");
    wait_until_file_exists(&clientpid_path)?;
    let first_clientpid = read_pidfile(&clientpid_path)?;

    send_signal(first_clientpid, libc::SIGTERM)?;
    let second_clientpid = wait_for_pidfile_to_change(&clientpid_path, first_clientpid)?;
    assert_ne!(second_clientpid, first_clientpid);
    process_exists(supervisor_pid)?;

    send_signal(supervisor_pid, libc::SIGTERM)?;
    wait_for_child_to_die(&mut child)?;
    check_file_does_not_exist(&pidfile)?;

    Ok(())
}

#[test]
fn test_control_plane_restart_and_stop() -> Result<()> {
    init_tracing();

    // Scenarios 2 and 3: a second `daemon` invocation talks to the first
    // purely through the pidfile, via --restart (USR1) then --stop (TERM).
    let pidfile = pidfile_name()?;
    let mut supervisor = daemon_command()
        .arg("--name")
        .arg("daemon-test-t2")
        .arg("--respawn")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .spawn()?;
    let supervisor_pid = supervisor.id() as libc::pid_t;

    wait_until_file_exists(&pidfile)?;
    assert_eq!(read_pidfile(&pidfile)?, supervisor_pid);
    let clientpid_path = pidfile.with_extension("clientpid");
    wait_until_file_exists(&clientpid_path)?;
    let first_clientpid = read_pidfile(&clientpid_path)?;

    let restart_status = daemon_command()
        .arg("--name")
        .arg("daemon-test-t2")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--restart")
        .status()?;
    assert!(restart_status.success());

    let second_clientpid = wait_for_pidfile_to_change(&clientpid_path, first_clientpid)?;
    assert_ne!(second_clientpid, first_clientpid);
    assert_eq!(read_pidfile(&pidfile)?, supervisor_pid, "supervisor pid must not change on restart");

    let stop_status = daemon_command()
        .arg("--name")
        .arg("daemon-test-t2")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--stop")
        .status()?;
    assert!(stop_status.success());

    wait_for_child_to_die(&mut supervisor)?;
    check_file_does_not_exist(&pidfile)?;

    Ok(())
}

#[test]
fn test_running_probe_reports_both_pids() -> Result<()> {
    init_tracing();

    let pidfile = pidfile_name()?;
    let mut supervisor = daemon_command()
        .arg("--name")
        .arg("daemon-test-t4")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--")
        .arg(helper_path())
        .spawn()?;
    let supervisor_pid = supervisor.id() as libc::pid_t;
    wait_until_file_exists(&pidfile)?;
    let clientpid_path = pidfile.with_extension("clientpid");
    wait_until_file_exists(&clientpid_path)?;
    let clientpid = read_pidfile(&clientpid_path)?;

    let output = daemon_command()
        .arg("--name")
        .arg("daemon-test-t4")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--running")
        .arg("--verbose")
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("daemon-test-t4 is running (pid {supervisor_pid}) (clientpid {clientpid})")
    );

    send_signal(supervisor_pid, libc::SIGTERM)?;
    wait_for_child_to_die(&mut supervisor)?;

    let after = daemon_command()
        .arg("--name")
        .arg("daemon-test-t4")
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--running")
        .arg("--verbose")
        .output()?;
    assert!(!after.status.success());
    assert_eq!(String::from_utf8_lossy(&after.stdout).trim(), "daemon-test-t4 is not running");

    Ok(())
}

#[test]
fn test_pty_noecho_single_copy() -> Result<()> {
    init_tracing();

    // Scenario 6: with the slave's echo disabled, writing a line to the
    // supervisor's stdin produces exactly one copy of it on stdout -- the
    // client's own output, not an echoed-then-relayed duplicate.
    let mut child = daemon_command()
        .arg("--foreground")
        .arg("--pty=noecho")
        .arg("--")
        .arg("/bin/cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    // Give the client time to exec and the PTY to come up before writing.
    std::thread::sleep(std::time::Duration::from_millis(300));

    let mut stdin = child.stdin.take().expect("piped stdin");
    stdin.write_all(b"abc\n")?;
    drop(stdin);

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut out = Vec::new();
    stdout.read_to_end(&mut out)?;

    wait_for_child_to_die(&mut child)?;

    assert_eq!(out, b"abc\n", "expected a single, unechoed copy of the input line");

    Ok(())
}
