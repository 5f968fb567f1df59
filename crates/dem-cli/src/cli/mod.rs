mod commands;
mod helpers;

use clap::Parser;
use dem_core::domain::DemError;

pub fn run_from_env() -> i32 {
    helpers::init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let error = error.as_dem_error();
            eprintln!("{}", error.diagnostic_line());
            error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("dem-pipeline".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();

    match Cli::try_parse_from(&full_args) {
        Ok(cli) => dispatch_parsed(cli.command),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(
    name = "dem-pipeline",
    about = "Per-pixel DEM inversion and FIP bias maps"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Estimate the DEM of every pixel and write the combined artifact
    Dem(commands::DemArgs),
    /// Compute composition ratios from an existing combined artifact
    Composition(commands::CompositionArgs),
    /// Run the DEM and composition stages for one observation
    Run(commands::RunArgs),
    /// Run every pending observation of a job queue
    Queue(commands::QueueArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Dem(args) => commands::run_dem_command(args),
        CliCommand::Composition(args) => commands::run_composition_command(args),
        CliCommand::Run(args) => commands::run_run_command(args),
        CliCommand::Queue(args) => commands::run_queue_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(DemError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_dem_error(&self) -> DemError {
        match self {
            Self::Usage(message) => DemError::input_validation("INPUT.CLI_USAGE", message.clone()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => DemError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CliError, run};

    #[test]
    fn help_exits_cleanly() {
        assert_eq!(run(["--help"]).expect("help should render"), 0);
    }

    #[test]
    fn unknown_subcommand_is_a_usage_error() {
        let error = run(["invert-everything"]).expect_err("unknown subcommand");
        assert!(matches!(error, CliError::Usage(_)));
        assert_eq!(error.as_dem_error().exit_code(), 2);
    }

    #[test]
    fn missing_observation_is_an_io_error() {
        let error = run(["dem", "/nonexistent/obs.json", "--emissivity", "/nonexistent/emis.json"])
            .expect_err("missing files");
        assert_eq!(error.as_dem_error().exit_code(), 3);
    }
}
