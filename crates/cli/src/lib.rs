pub mod bootstrap;
pub mod commands;
pub mod pipeline;
pub mod sync;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use touchpoint_core::config::{LoadOptions, LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

use crate::commands::run::RunArgs;

#[derive(Debug, Parser)]
#[command(
    name = "touchpoint",
    about = "Daily sales follow-up digest",
    long_about = "Find leads due for a follow-up touch, match their first call to a transcript and draft the email.",
    after_help = "Examples:\n  touchpoint run --today 2026-03-05\n  touchpoint status\n  touchpoint doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to touchpoint.toml (defaults to ./touchpoint.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Build today's digest and write it as JSON")]
    Run {
        #[arg(long, help = "Ignore cached drafts and regenerate")]
        fresh: bool,
        #[arg(long, value_name = "NAME", help = "Log the follow-up history of leads matching NAME")]
        debug_lead: Option<String>,
        #[arg(long, value_name = "PATH", help = "Write the digest here instead of digest.output_path")]
        output: Option<PathBuf>,
        #[arg(long, value_name = "YYYY-MM-DD", help = "Evaluate the cadence as of this date")]
        today: Option<NaiveDate>,
        #[arg(long, help = "Number of leads processed concurrently")]
        workers: Option<usize>,
    },
    #[command(about = "Print the cadence tracker without drafting")]
    Status {
        #[arg(long, value_name = "YYYY-MM-DD")]
        today: Option<NaiveDate>,
    },
    #[command(about = "Pull missing live transcripts into the transcript cache")]
    SyncTranscripts {
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, CRM reachability and cache database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending cache database migrations and return structured status output")]
    Migrate,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        ..LoadOptions::default()
    };

    let result = match cli.command {
        Command::Run { fresh, debug_lead, output, today, workers } => commands::run::run(
            &options,
            RunArgs { fresh, debug_lead, output, today, workers },
        ),
        Command::Status { today } => commands::status::run(&options, today),
        Command::SyncTranscripts { batch_size } => {
            commands::sync_transcripts::run(&options, batch_size)
        }
        Command::Config => commands::CommandResult::report(commands::config::run(&options)),
        Command::Doctor { json } => commands::CommandResult::report(commands::doctor::run(&options, json)),
        Command::Migrate => commands::migrate::run(&options),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber. Logs go to stderr so stdout stays parseable.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // A second command in the same process keeps the first subscriber.
    let _ = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
