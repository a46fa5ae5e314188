//! Paper-trading platform - main entry point
//!
//! Subcommands:
//! - run: start the core with its background tasks (dispatcher,
//!   stop scanner, coordinator + pyramid timer)
//! - intake: queue a purchase-order CSV into the approval pipeline
//! - rebuild: reconstruct the TS store from SOT facts
//! - summary: print positions, trades, PnL, and pyramid sessions

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Exit codes fixed by the CLI contract.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_STORE: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "paper-trading")]
#[command(about = "Paper-trading execution platform with approval queue and pyramid DCA", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the core service
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,

        /// Use the static offline price source instead of the live feed
        #[arg(long)]
        offline: bool,
    },

    /// Queue a purchase-order CSV into the approval pipeline
    Intake {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,

        /// CSV export of the purchase-order sheet
        #[arg(short, long)]
        file: String,
    },

    /// Rebuild the TS store from SOT facts
    Rebuild {
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,
    },

    /// Print positions, trades, PnL, and pyramid sessions
    Summary {
        #[arg(short, long, default_value = "configs/paper.json")]
        config: String,
    },
}

/// Console logging always; the long-running `run` command also logs to
/// a daily-rolled file. The returned guard keeps the non-blocking
/// writer flushing until exit.
fn init_tracing(verbose: bool, log_to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if log_to_file {
        let appender = tracing_appender::rolling::daily("logs", "paper-trading.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, matches!(cli.command, Commands::Run { .. }));

    let outcome = match cli.command {
        Commands::Run { config, offline } => commands::run::run(&config, offline),
        Commands::Intake { config, file } => commands::intake::run(&config, &file),
        Commands::Rebuild { config } => commands::rebuild::run(&config),
        Commands::Summary { config } => commands::summary::run(&config),
    };

    let code = match outcome {
        Ok(commands::Outcome::Done) => EXIT_OK,
        Ok(commands::Outcome::Interrupted) => EXIT_INTERRUPTED,
        Err(commands::CommandError::Config(err)) => {
            eprintln!("configuration error: {err:#}");
            EXIT_CONFIG
        }
        Err(commands::CommandError::StoreOpen(err)) => {
            eprintln!("store open failure: {err:#}");
            EXIT_STORE
        }
        Err(commands::CommandError::Other(err)) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
