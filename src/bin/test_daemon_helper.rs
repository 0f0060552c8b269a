//! Minimal client program used by the integration tests in `tests/test.rs`
//! as the command the `daemon` binary supervises. Writes a greeting file on
//! startup (so a test can tell it actually ran), optionally exits after a
//! fixed delay with a chosen status (to exercise respawn/burst behavior),
//! and otherwise sleeps until signaled.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "test-daemon-helper")]
struct Args {
    /// File to write a greeting line to on startup.
    #[arg(long)]
    greeting_file: Option<PathBuf>,

    /// Exit this many seconds after startup instead of running forever.
    #[arg(long)]
    exit_after: Option<u64>,

    /// Exit status to use when `--exit-after` fires.
    #[arg(long, default_value_t = 0)]
    exit_code: i32,

    /// Echo each line of stdin back to stdout, for PTY/relay tests.
    #[arg(long)]
    echo_stdin: bool,
}

fn main() {
    let args = Args::parse();

    if let Some(path) = &args.greeting_file {
        let greeting = format!("test-daemon-helper: running as pid {}\n", std::process::id());
        let _ = std::fs::write(path, greeting);
    }

    if args.echo_stdin {
        let mut line = String::new();
        while std::io::stdin().read_line(&mut line).unwrap_or(0) > 0 {
            print!("{line}");
            let _ = std::io::stdout().flush();
            line.clear();
        }
        return;
    }

    match args.exit_after {
        Some(secs) => {
            std::thread::sleep(Duration::from_secs(secs));
            std::process::exit(args.exit_code);
        }
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }
}
