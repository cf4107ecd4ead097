mod cli;
mod config;
mod console;
mod orchestrator;
mod scenario;
mod telemetry;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli::handle_command(cli)
}
