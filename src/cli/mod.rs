//! CLI command handling.
//!
//! Provides subcommands for:
//! - Pre-starting database containers ahead of a test run (`start`)
//! - Killing them by derived name (`stop`)
//! - Killing every container recorded in a session ledger (`sweep`)

mod containers;
mod sweep;

pub use containers::{run_start_command, run_stop_command};
pub use sweep::run_sweep_command;

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

use crate::config::Config;
use crate::container::Engine;
use crate::runtime::{ContainerRuntime, DockerRuntime};

#[derive(Parser, Debug)]
#[command(name = "pmr")]
#[command(about = "Ephemeral database containers for integration tests")]
#[command(
    long_about = "pmr starts and stops the database containers integration tests run against.\nExamples:\n  pmr start postgres redis  # Warm up containers before a test run\n  pmr stop postgres  # Kill the postgres container\n  pmr sweep  # Kill containers recorded by a multi-process test session"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start containers and leave them running
    Start {
        /// Engines to start (mongo, mysql, postgres, redis, redshift)
        #[arg(required = true)]
        engines: Vec<Engine>,
    },

    /// Kill containers started earlier
    Stop {
        /// Engines to stop (mongo, mysql, postgres, redis, redshift)
        #[arg(required = true)]
        engines: Vec<Engine>,
    },

    /// Kill every container recorded in a session ledger
    Sweep {
        /// Session directory holding pmr.json (defaults to PMR_SESSION_DIR)
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// Print the sweep report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run a CLI command against the local Docker daemon.
pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let runtime = DockerRuntime::connect_with_retry(config.docker_api_version, &config.connect).await?;

    let result = match cli.command {
        Command::Start { engines } => run_start_command(&runtime, &config, &engines).await,
        Command::Stop { engines } => run_stop_command(&runtime, &engines).await,
        Command::Sweep { session_dir, json } => {
            run_sweep_command(&runtime, &config, session_dir.as_deref(), json).await
        }
    };

    runtime.close();
    result
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_engines() {
        let cli = Cli::try_parse_from(["pmr", "start", "postgres", "redis"]).unwrap();
        match cli.command {
            Command::Start { engines } => assert_eq!(engines, vec![Engine::Postgres, Engine::Redis]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let err = Cli::try_parse_from(["pmr", "stop", "oracle"]).unwrap_err();
        assert!(err.to_string().contains("invalid engine 'oracle'"));
    }

    #[test]
    fn test_engines_required() {
        assert!(Cli::try_parse_from(["pmr", "start"]).is_err());
    }

    #[test]
    fn test_parse_sweep() {
        let cli = Cli::try_parse_from(["pmr", "sweep", "--session-dir", "/tmp/s"]).unwrap();
        match cli.command {
            Command::Sweep { session_dir, json } => {
                assert_eq!(session_dir, Some(PathBuf::from("/tmp/s")));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
