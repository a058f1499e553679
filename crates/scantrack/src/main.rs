//! Scantrack launcher.

use clap::{Parser, Subcommand};
use scantrack::cli;
use scantrack::cli::blacklist::{BlacklistAction, BlacklistArgs};
use scantrack::cli::checklist::{ChecklistAction, ChecklistArgs};
use scantrack::cli::redcap::RedcapArgs;
use scantrack::cli::run::RunArgs;
use scantrack_logging::{init_logging, LogConfig, Verbosity};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "scantrack", about = "Neuroimaging pipeline bookkeeping", version)]
struct Cli {
    /// Path to the study configuration file
    #[arg(long, global = true, default_value = "study.toml")]
    config: PathBuf,

    /// Log what would happen without writing or submitting anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Only show errors
    #[arg(short, long, global = true, conflicts_with_all = ["verbose", "debug"])]
    quiet: bool,

    /// Show informational output
    #[arg(short, long, global = true, conflicts_with = "debug")]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit the ENIGMA-DTI pipeline for a study
    Run {
        /// Tag selecting the input FA image
        #[arg(long, default_value = "_FA.nii.gz")]
        fa_tag: String,

        /// Only process subjects whose id contains this substring
        #[arg(long)]
        subject_filter: Option<String>,

        /// Narrow ambiguous FA matches by file-name substring
        #[arg(long)]
        fa_filter: Option<String>,

        /// Only process subjects signed off in the QC checklist
        #[arg(long)]
        qc_transfer: bool,

        /// Walltime for each subject job
        #[arg(long, default_value = "2:00:00")]
        walltime: String,

        /// Walltime for the consolidation job
        #[arg(long, default_value = "2:00:00")]
        walltime_post: String,

        /// Submit only the consolidation job
        #[arg(long, conflicts_with = "no_post")]
        post_only: bool,

        /// Suppress the consolidation job
        #[arg(long)]
        no_post: bool,
    },

    /// Import REDCap scan-completed records into the dashboard
    Redcap,

    /// Show or update the QC checklist
    Checklist {
        #[command(subcommand)]
        action: ChecklistCommand,
    },

    /// Show or update the scan blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ChecklistCommand {
    /// Print all checklist entries
    Show,
    /// Register a session, optionally signing it off with a comment
    Update {
        subject: String,
        comment: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BlacklistCommand {
    /// Print all blacklist entries
    Show,
    /// Blacklist a scan with a reason
    Update { scan: String, reason: String },
}

fn verbosity(cli: &Cli) -> Verbosity {
    if cli.debug {
        Verbosity::Debug
    } else if cli.verbose {
        Verbosity::Verbose
    } else if cli.quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Normal
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "scantrack",
        verbosity: verbosity(&cli),
    }) {
        eprintln!("Failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Run {
            fa_tag,
            subject_filter,
            fa_filter,
            qc_transfer,
            walltime,
            walltime_post,
            post_only,
            no_post,
        } => {
            cli::run::run(RunArgs {
                config: cli.config,
                fa_tag,
                subject_filter,
                fa_filter,
                qc_transfer,
                walltime,
                walltime_post,
                post_only,
                no_post,
                dry_run: cli.dry_run,
            })
            .await
        }
        Command::Redcap => {
            cli::redcap::run(RedcapArgs {
                config: cli.config,
                dry_run: cli.dry_run,
            })
            .await
        }
        Command::Checklist { action } => {
            let action = match action {
                ChecklistCommand::Show => ChecklistAction::Show,
                ChecklistCommand::Update { subject, comment } => {
                    ChecklistAction::Update { subject, comment }
                }
            };
            cli::checklist::run(ChecklistArgs {
                config: cli.config,
                action,
                dry_run: cli.dry_run,
            })
            .await
        }
        Command::Blacklist { action } => {
            let action = match action {
                BlacklistCommand::Show => BlacklistAction::Show,
                BlacklistCommand::Update { scan, reason } => {
                    BlacklistAction::Update { scan, reason }
                }
            };
            cli::blacklist::run(BlacklistArgs {
                config: cli.config,
                action,
                dry_run: cli.dry_run,
            })
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
