use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use shepherd::commands;
use shepherd::config::{Config, ConfigError, EXPECTED_ENV};

#[derive(Parser)]
#[command(
    name = "shepherd",
    version,
    about = "Distributed bulk-copy orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Submit a FoFN for transfer into a target subcollection
    Submit {
        /// File of filenames (newline-delimited; optionally gzipped)
        fofn: PathBuf,
        /// Subcollection under the iRODS base to transfer into
        subcollection: String,
        /// Sources are Vault paths; derive targets by decoding them
        #[arg(long)]
        vault: bool,
    },

    /// Report the status of a job
    Status { job_id: i64 },

    /// Preparation worker (internal; invoked by the executor)
    #[command(name = "__prepare", hide = true)]
    Prepare { job_id: i64 },

    /// Transfer worker (internal; invoked by the executor)
    #[command(name = "__transfer", hide = true)]
    Transfer { job_id: i64 },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Panics are failures of this program, not the transfer: log and die
    std::panic::set_hook(Box::new(|panic| {
        log::error!("{panic}");
        std::process::exit(1);
    }));

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // clap renders its own message; exit 1 on invalid modes
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error @ ConfigError::Missing(_)) => {
            log::error!("{error}");

            let width = EXPECTED_ENV.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
            for (name, description) in EXPECTED_ENV {
                log::info!("* {name:width$}  {description}");
            }

            return ExitCode::from(1);
        }
        Err(error) => {
            log::error!("{error}");
            return ExitCode::from(1);
        }
    };

    let outcome = match cli.mode {
        Mode::Submit {
            fofn,
            subcollection,
            vault,
        } => commands::submit::run(&config, &fofn, &subcollection, vault),
        Mode::Status { job_id } => commands::status::run(&config, job_id),
        Mode::Prepare { job_id } => commands::prepare::run(&config, job_id),
        Mode::Transfer { job_id } => commands::transfer::run(&config, job_id),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error:#}");
            ExitCode::from(1)
        }
    }
}
