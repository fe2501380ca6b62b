//! asimov: supervise scientific analyses on an HTCondor pool
//!
//! Every command except `init` and `clone` works on the project in the
//! current directory. Exit codes: 0 on success, 1 outside a project or on
//! an operational failure, 2 for a bad invocation or a rejected description.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use asimov_core::AsimovError;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "asimov", version, about = "Workflow supervisor for scientific analyses")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a project in the current directory
    Init {
        /// Project name
        name: String,
    },

    /// Copy another project's configuration and ledger here
    Clone {
        /// Directory of the project to copy
        source: PathBuf,
    },

    /// Apply description documents to the ledger
    Apply {
        /// YAML file holding one or more documents
        #[arg(short, long)]
        file: PathBuf,

        /// Subject for analysis documents that name none
        #[arg(short = 'e', long = "event")]
        subject: Option<String>,
    },

    /// Build or submit ready analyses
    Manage {
        #[command(subcommand)]
        action: ManageAction,
    },

    /// Run one reconciliation pass over active analyses
    Monitor {
        /// Build and submit before monitoring
        #[arg(long)]
        chain: bool,

        /// Report intended actions without changing anything
        #[arg(long)]
        dryrun: bool,
    },

    /// Submit the periodic monitor job
    Start,

    /// Remove the periodic monitor job
    Stop,

    /// Print project reports
    Report {
        #[arg(value_enum)]
        kind: ReportKind,
    },

    /// Inspect and change individual analyses
    Production {
        #[command(subcommand)]
        action: ProductionAction,
    },
}

#[derive(Debug, Subcommand)]
enum ManageAction {
    /// Render configurations and build job graphs
    Build {
        /// Only this subject
        #[arg(short = 'e', long = "event")]
        subject: Option<String>,

        #[arg(long)]
        dryrun: bool,
    },

    /// Submit built job graphs
    Submit {
        /// Only this subject
        #[arg(short = 'e', long = "event")]
        subject: Option<String>,

        #[arg(long)]
        dryrun: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportKind {
    Html,
    Status,
    Ledger,
}

#[derive(Debug, Subcommand)]
enum ProductionAction {
    /// Add an analysis to a subject
    Create {
        subject: String,
        name: String,

        #[arg(long)]
        pipeline: String,

        /// Selectors of analyses this one needs
        #[arg(long, num_args = 1..)]
        needs: Vec<String>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// List stored results
    Results { subject: String, name: String },

    /// Request a status change
    SetStatus {
        subject: String,
        name: String,
        status: String,
    },

    /// Append a review message
    Review {
        subject: String,
        name: String,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        message: String,
    },
}

/// Invocation errors found after argument parsing
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new(default)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    if error.is::<UsageError>() {
        return 2;
    }
    match error.downcast_ref::<AsimovError>() {
        Some(AsimovError::NotAProject(_)) => 1,
        Some(e) if e.is_user_error() => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let result = match std::env::current_dir() {
        Ok(root) => commands::run(cli.command, &root).await,
        Err(e) => Err(anyhow::Error::new(e).context("cannot determine the current directory")),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_manage_submit() {
        let cli =
            Cli::try_parse_from(["asimov", "manage", "submit", "-e", "S0", "--dryrun"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Manage {
                action: ManageAction::Submit { subject: Some(ref s), dryrun: true }
            } if s == "S0"
        ));
    }

    #[test]
    fn test_parse_production_create() {
        let cli = Cli::try_parse_from([
            "asimov",
            "production",
            "create",
            "S0",
            "A1",
            "--pipeline",
            "command",
            "--needs",
            "A0",
            "pipeline:dagman",
        ])
        .unwrap();
        let Commands::Production {
            action: ProductionAction::Create { needs, pipeline, .. },
        } = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(pipeline, "command");
        assert_eq!(needs, vec!["A0", "pipeline:dagman"]);
    }

    #[test]
    fn test_bad_report_kind_is_rejected() {
        assert!(Cli::try_parse_from(["asimov", "report", "pdf"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let not_a_project = anyhow::Error::new(AsimovError::NotAProject(PathBuf::from("/tmp")));
        assert_eq!(exit_code(&not_a_project), 1);
        let usage = anyhow::Error::new(UsageError("no".into()));
        assert_eq!(exit_code(&usage), 2);
        let unknown =
            anyhow::Error::new(AsimovError::UnknownProduction("S0/A9".into())).context("results");
        assert_eq!(exit_code(&unknown), 2);
    }
}
