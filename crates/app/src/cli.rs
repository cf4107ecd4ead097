use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::{
    config::{SimulatorCliArgs, SimulatorConfig},
    orchestrator,
    scenario::Scenario,
};

/// Proximity-triggered vehicle-to-vehicle session simulator.
#[derive(Debug, Parser)]
#[command(name = "v2v-sim", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one vehicle: camera, marker tracking, sessions and motion telemetry.
    Run(SimulatorCliArgs),
    /// Load and validate a scenario file, then print a summary.
    CheckScenario(CheckScenarioArgs),
}

#[derive(Debug, Args)]
pub struct CheckScenarioArgs {
    /// JSON scenario file.
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => orchestrator::run(SimulatorConfig::try_from(args)?),
        Command::CheckScenario(args) => {
            let scenario = Scenario::load(&args.path)?;
            println!("{}", scenario.summary());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse_into_a_config() {
        let cli = Cli::try_parse_from([
            "v2v-sim",
            "run",
            "--address",
            "AA:BB:CC:DD:EE:FF",
            "--peer",
            "11:22:33:44:55:66=127.0.0.1:7421",
            "--peer",
            "22:33:44:55:66:77=127.0.0.1:7422",
            "--fps",
            "20",
            "--calibrate-at-frame",
            "40",
        ])
        .expect("valid flags");
        let Command::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        let config = SimulatorConfig::try_from(args).expect("valid config");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.frame.fps, Some(20.0));
        assert_eq!(config.calibrate_at_frame, Some(40));
        assert_eq!(config.log_dir, PathBuf::from("v2v-logs"));
    }

    #[test]
    fn check_scenario_takes_a_path() {
        let cli = Cli::try_parse_from(["v2v-sim", "check-scenario", "demos/follow-leader.json"])
            .expect("valid flags");
        assert!(matches!(
            cli.command,
            Command::CheckScenario(CheckScenarioArgs { ref path }) if path.ends_with("follow-leader.json")
        ));
    }
}
