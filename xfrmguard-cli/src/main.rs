//! `xfrmguard` operator CLI.

mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use xfrmguard_core::config::XfrmGuardConfig;
use xfrmguard_core::logging::init_tracing;

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::output::OutputWriter;

fn main() {
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<(), CliError> {
    // Broken files are reported by the command itself.
    let mut general = XfrmGuardConfig::from_file(&cli.config)
        .map(|c| c.general)
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        general.log_level.clone_from(level);
    }
    init_tracing(&general)?;
    xfrmguard_core::metrics::describe_all();

    tracing::debug!(config = %cli.config.display(), "xfrmguard starting");

    let writer = OutputWriter::new(cli.output);
    match cli.command {
        Commands::Config(args) => commands::config::execute(args, &cli.config, &writer),
        Commands::Policy(args) => commands::policy::execute(args, &cli.config, &writer),
    }
}
