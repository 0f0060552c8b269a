//! The CLI surface of spec.md §6, as a `clap`-derived struct generalizing
//! the teacher's `#[derive(Parser)] struct Daemonize` pattern
//! (`examples/vmware-archive-nerpa/daemon/src/lib.rs`) to the full option set.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "daemon", version, about = "Turn a command into a supervised background service")]
pub struct Cli {
    /// Identifier for this instance; governs pidfile naming and uniqueness.
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Command to run, as a single string (shell-lite parsed), an alternative to trailing argv.
    #[arg(short = 'X', long = "command")]
    pub command: Option<String>,

    /// Explicit config file to read instead of the default search path.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Skip reading any config file.
    #[arg(short = 'N', long)]
    pub noconfig: bool,

    /// Directory to compose `<dir>/<name>.pid` from.
    #[arg(short = 'P', long)]
    pub pidfiles: Option<PathBuf>,

    /// Explicit pidfile path, overriding name/dir composition.
    #[arg(short = 'F', long)]
    pub pidfile: Option<PathBuf>,

    /// `USER[:[GROUP]]` or `USER[.[GROUP]]` to run as.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Directory to chroot into before config load.
    #[arg(short = 'R', long)]
    pub chroot: Option<PathBuf>,

    /// Directory to chdir into before exec.
    #[arg(short = 'D', long)]
    pub chdir: Option<PathBuf>,

    /// Umask to apply before exec, as octal text.
    #[arg(short = 'm', long)]
    pub umask: Option<String>,

    /// `VAR=VAL` environment entries for the client; repeatable.
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Inherit the supervisor's environment instead of starting empty.
    #[arg(short = 'i', long)]
    pub inherit: bool,

    /// Disable the safety classifier.
    #[arg(short = 'U', long)]
    pub unsafe_: bool,

    /// Force the safety classifier on even for a non-root real uid.
    #[arg(short = 'S', long)]
    pub safe: bool,

    /// Allow core dumps from the client.
    #[arg(short = 'c', long)]
    pub core: bool,

    /// Disable core dumps from the client (default).
    #[arg(long)]
    pub nocore: bool,

    /// Restart the client when it exits.
    #[arg(short = 'r', long)]
    pub respawn: bool,

    /// Seconds a run must last to be considered successful.
    #[arg(short = 'a', long)]
    pub acceptable: Option<u64>,

    /// Consecutive rapid failures allowed before a burst delay.
    #[arg(short = 'A', long)]
    pub attempts: Option<u32>,

    /// Seconds to sleep after a burst before trying again.
    #[arg(short = 'L', long)]
    pub delay: Option<u64>,

    /// Number of bursts allowed before giving up (0 = unlimited).
    #[arg(short = 'M', long)]
    pub limit: Option<u32>,

    /// Widen respawn-policy bounds and allow uid-0 variable expansion.
    #[arg(long)]
    pub idiot: bool,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Run the client attached to a pseudo-terminal; `=noecho` disables slave echo.
    #[arg(short = 'p', long, num_args = 0..=1, default_missing_value = "")]
    pub pty: Option<String>,

    /// Bind the supervisor's lifetime to the calling logind session.
    #[arg(short = 'B', long)]
    pub bind: bool,

    /// Sink for the supervisor's own error messages.
    #[arg(short = 'l', long)]
    pub errlog: Option<String>,

    /// Sink for the supervisor's own debug messages.
    #[arg(short = 'b', long)]
    pub dbglog: Option<String>,

    /// Sink for both client stdout and stderr.
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Sink for client stdout only.
    #[arg(short = 'O', long)]
    pub stdout: Option<String>,

    /// Sink for client stderr only.
    #[arg(short = 'E', long)]
    pub stderr: Option<String>,

    /// Reap immediately on SIGCHLD without draining remaining output.
    #[arg(long)]
    pub ignore_eof: bool,

    /// Drain remaining output to EOF before reaping (default).
    #[arg(long)]
    pub read_eof: bool,

    /// Report whether the named instance is running.
    #[arg(long)]
    pub running: bool,

    /// Ask the named instance's supervisor to restart its client.
    #[arg(long)]
    pub restart: bool,

    /// Ask the named instance's supervisor to terminate.
    #[arg(long)]
    pub stop: bool,

    /// Send a named or numeric signal to the named instance's client.
    #[arg(long)]
    pub signal: Option<String>,

    /// List all discoverable named instances.
    #[arg(long)]
    pub list: bool,

    /// Verbosity level for human-readable progress messages. Also gates the
    /// text output of `--running`/`--list`; without it, only the exit code
    /// reports status.
    #[arg(short = 'v', long, num_args = 0..=1, default_missing_value = "1")]
    pub verbose: Option<u8>,

    /// Debug level; at level >= 2 the resolved configuration is dumped.
    #[arg(short = 'd', long, num_args = 0..=1, default_missing_value = "1")]
    pub debug: Option<u8>,

    /// Client command and arguments, when not given via `--command`.
    #[arg(trailing_var_arg = true)]
    pub cmd_argv: Vec<String>,
}
