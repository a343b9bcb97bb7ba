//! mailfw
//!
//! Runs Maildir queries through a supervised driver worker.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mailfw::config::AppConfig;
use mailfw::maildir::{MaildirCommand, MaildirReply};
use mailfw::supervisor::{CommandOutcome, Supervisor, SupervisorReport};
use mailfw_runtime::Substrate;

/// mailfw supervised mail drivers
#[derive(Parser, Debug)]
#[command(name = "mailfw")]
#[command(about = "Supervised Maildir driver", long_about = None, version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maildir root (overrides the configuration)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Worker substrate: thread or task (overrides the configuration)
    #[arg(long)]
    substrate: Option<Substrate>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the folders of the Maildir
    Folders,
    /// Count messages in one or more folders
    Count {
        #[arg(required = true)]
        folders: Vec<String>,
    },
    /// Print the effective configuration and exit
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mailfw=info,mailfw_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(root) = args.root {
        config.maildir.root = root;
    }
    if let Some(substrate) = args.substrate {
        config.runtime.substrate = substrate;
    }

    let commands = match args.command {
        Command::Check => {
            print!("{}", config.to_toml()?);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Folders => vec![MaildirCommand::ListFolders],
        Command::Count { folders } => folders
            .into_iter()
            .map(|folder| MaildirCommand::CountMessages { folder })
            .collect(),
    };

    info!(
        "Starting mailfw v{} on {} ({} substrate)",
        env!("CARGO_PKG_VERSION"),
        config.maildir.root.display(),
        config.runtime.substrate
    );

    let mut supervisor = Supervisor::new(config);
    let report = supervisor.run(commands).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn print_report(report: &SupervisorReport) {
    for outcome in &report.outcomes {
        match outcome {
            CommandOutcome::Completed {
                reply: MaildirReply::Folders(folders),
                ..
            } => {
                for folder in folders {
                    println!("{folder}");
                }
            }
            CommandOutcome::Completed {
                command: MaildirCommand::CountMessages { folder },
                reply: MaildirReply::Count(count),
            } => println!("{folder}\t{count}"),
            CommandOutcome::Completed { command, reply } => {
                println!("{command:?}\t{reply:?}");
            }
            CommandOutcome::Interrupted { interruption, .. } => {
                eprintln!("error: {interruption}");
            }
        }
    }
}
