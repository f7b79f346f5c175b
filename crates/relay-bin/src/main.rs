//! outbox-relay: propagates outbox events into the search index and exposes
//! operator controls over the outbox.

mod commands;
mod output;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_config_and_utils::{init_logging, parse_level, Config, Paths};
use tracing::debug;

/// Outbox relay command-line interface.
#[derive(Parser)]
#[command(name = "outbox-relay")]
#[command(about = "Transactional outbox relay and search-index synchronizer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, database and logs. Defaults to ~/.outbox-relay
    #[arg(long, global = true, env = "OUTBOX_RELAY_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: output::OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher until Ctrl-C
    Run {
        /// Identifier recorded on claimed events. Defaults to <hostname>-<pid>
        #[arg(long)]
        instance_id: Option<String>,
        /// Only dispatch events of this aggregate type
        #[arg(long)]
        partition: Option<String>,
    },
    /// Show outbox counts, staleness and checkpoint
    Stats,
    /// Show the retained events of one aggregate in sequence order
    History {
        /// Aggregate type, e.g. `order`
        aggregate_type: String,
        /// Aggregate id
        aggregate_id: String,
    },
    /// Write the effective configuration to config.json
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Requeue claims that exceeded the liveness timeout and advance the checkpoint
    Sweep,
    /// Delete dispatched events past the retention window
    Purge {
        /// Retention in hours. Defaults to dispatcher.retention_hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Inspect and resolve dead-lettered events
    Dead {
        #[command(subcommand)]
        command: DeadCommands,
    },
}

#[derive(Subcommand)]
enum DeadCommands {
    /// List dead events, oldest first
    List {
        /// Maximum number of events to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Return a dead event to pending with a fresh retry budget
    Requeue {
        /// Event ID
        id: String,
    },
    /// Permanently delete a dead event, unblocking its aggregate
    Discard {
        /// Event ID
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = cli.format;

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{e:#}"), &format);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // Only the long-running dispatcher mirrors logs to stderr.
    let foreground = matches!(cli.command, Commands::Run { .. });
    let log_file = init_logging(&config.log_level, paths.log_file(), foreground)?;
    debug!(
        level = %parse_level(&config.log_level),
        log_file = %log_file.display(),
        "Logging initialized"
    );

    let format = cli.format;
    match cli.command {
        Commands::Run {
            instance_id,
            partition,
        } => commands::run(&config, &paths, instance_id, partition).await,
        Commands::Stats => commands::stats(&config, &paths, &format).await,
        Commands::History {
            aggregate_type,
            aggregate_id,
        } => commands::history(&config, &paths, &aggregate_type, &aggregate_id, &format).await,
        Commands::Init { force } => commands::init(&config, &paths, force, &format),
        Commands::Sweep => commands::sweep(&config, &paths, &format).await,
        Commands::Purge { older_than_hours } => {
            commands::purge(&config, &paths, older_than_hours, &format).await
        }
        Commands::Dead { command } => match command {
            DeadCommands::List { limit } => commands::dead_list(&config, &paths, limit, &format).await,
            DeadCommands::Requeue { id } => commands::dead_requeue(&config, &paths, &id, &format).await,
            DeadCommands::Discard { id } => commands::dead_discard(&config, &paths, &id, &format).await,
        },
    }
}
