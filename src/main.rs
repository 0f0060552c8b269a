use clap::Parser;
use tracing::event;
use tracing::Level;

use daemon::cli::Cli;
use daemon::orchestrator;

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match orchestrator::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            event!(Level::ERROR, "{}", e);
            std::process::exit(1);
        }
    }
}
