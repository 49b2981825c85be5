//! CLI command definitions for the `pipeworks` binary.
//!
//! Uses clap derive macros for argument parsing. Execution management
//! commands read the data directory only; `run` executes the bundled demo
//! pipeline.

pub mod executions;
pub mod run;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use pipeworks_types::pipeline::FanoutMode;
use uuid::Uuid;

/// Run checkpointed pipelines and inspect recorded executions.
#[derive(Parser)]
#[command(name = "pipeworks", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List recorded executions, oldest first.
    #[command(alias = "ls")]
    Execs {
        /// Show every execution without asking.
        #[arg(long)]
        all: bool,
    },

    /// Show the status of one execution.
    Exec {
        /// Execution id.
        id: Uuid,
    },

    /// List executions that have not finished.
    Active,

    /// List executions started in the last 24 hours.
    Today,

    /// Delete checkpoints, recorded requests and logs of old executions.
    Clear {
        /// Minimum age in hours.
        hours: u32,

        /// Skip confirmation prompt.
        #[arg(long, short)]
        force: bool,
    },

    /// Run the bundled demo pipeline (seed users, filter, summarise).
    Run {
        /// Fan-out mode of the filter step.
        #[arg(long, default_value = "concurrent")]
        mode: FanoutMode,

        /// Reuse checkpoints from this execution for the skipped steps.
        #[arg(long, requires = "skip")]
        resume_from: Option<Uuid>,

        /// Step to load from the resumed execution instead of running it.
        #[arg(long = "skip", requires = "resume_from")]
        skip: Vec<String>,

        /// Human-readable execution name.
        #[arg(long, default_value = "demo")]
        name: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl Commands {
    /// Whether the command starts a new execution (and so gets its own log file).
    pub fn starts_execution(&self) -> bool {
        matches!(self, Commands::Run { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["pipeworks", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                mode,
                resume_from,
                skip,
                name,
            } => {
                assert_eq!(mode, FanoutMode::Concurrent);
                assert!(resume_from.is_none());
                assert!(skip.is_empty());
                assert_eq!(name, "demo");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_with_resume_and_global_flags() {
        let id = Uuid::now_v7();
        let cli = Cli::try_parse_from([
            "pipeworks",
            "run",
            "--mode",
            "sequential",
            "--resume-from",
            &id.to_string(),
            "--skip",
            "seed",
            "--skip",
            "filter",
            "-vv",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                mode,
                resume_from,
                skip,
                ..
            } => {
                assert_eq!(mode, FanoutMode::Sequential);
                assert_eq!(resume_from, Some(id));
                assert_eq!(skip, vec!["seed", "filter"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn skip_requires_resume_source() {
        assert!(Cli::try_parse_from(["pipeworks", "run", "--skip", "seed"]).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["pipeworks", "run", "--mode", "parallel"]).is_err());
    }

    #[test]
    fn exec_requires_a_uuid() {
        assert!(Cli::try_parse_from(["pipeworks", "exec", "nope"]).is_err());
        assert!(Cli::try_parse_from(["pipeworks", "exec", &Uuid::nil().to_string()]).is_ok());
    }
}
