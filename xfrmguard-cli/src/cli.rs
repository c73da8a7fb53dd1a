//! CLI argument parsing using clap derive API
//!
//! Purely declarative; no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// xfrmguard -- IPsec XFRM policy reconciliation.
///
/// Use `xfrmguard <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "xfrmguard", version, about, long_about = None)]
pub struct Cli {
    /// Path to the xfrmguard.toml configuration file.
    #[arg(short, long, default_value = "xfrmguard.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table / text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage configuration.
    Config(ConfigArgs),

    /// Inspect and unwind kernel XFRM policies.
    Policy(PolicyArgs),
}

// ---- config ----

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration file.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Show only one section (general, ipsec).
        #[arg(long)]
        section: Option<String>,
    },
}

// ---- policy ----

#[derive(Args, Debug)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub action: PolicyAction,
}

#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// List kernel XFRM policies carrying the configured request id.
    List {
        /// Include policies owned by other agents.
        #[arg(long)]
        all: bool,
    },
    /// Unwind this host's policies through the graceful shutdown phases.
    Cleanup {
        /// Use the 5s/10s grace timings.
        #[arg(long)]
        short_grace: bool,

        /// Delay between reconciliation rounds, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
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
    fn parses_policy_cleanup_flags() {
        let cli = Cli::try_parse_from([
            "xfrmguard",
            "--config",
            "/etc/xfrmguard/xfrmguard.toml",
            "policy",
            "cleanup",
            "--short-grace",
            "--interval-ms",
            "250",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/xfrmguard/xfrmguard.toml"));
        match cli.command {
            Commands::Policy(PolicyArgs {
                action:
                    PolicyAction::Cleanup {
                        short_grace,
                        interval_ms,
                    },
            }) => {
                assert!(short_grace);
                assert_eq!(interval_ms, 250);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "xfrmguard", "config", "show", "--section", "ipsec", "--output", "json",
        ])
        .unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        assert_eq!(cli.config, PathBuf::from("xfrmguard.toml"));
    }

    #[test]
    fn policy_list_defaults_to_owned_only() {
        let cli = Cli::try_parse_from(["xfrmguard", "policy", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Policy(PolicyArgs {
                action: PolicyAction::List { all: false }
            })
        ));
    }

    #[test]
    fn rejects_unknown_output_format() {
        assert!(Cli::try_parse_from(["xfrmguard", "--output", "yaml", "config", "validate"]).is_err());
    }
}
