mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sessionview")]
#[command(about = "Stream and control remote automation sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to one remote session and log its lifecycle
    Watch {
        /// Protocol family (screencast, framebuffer, terminal)
        #[arg(short, long)]
        family: String,

        /// Capability token for the session
        #[arg(short, long)]
        token: String,

        /// Forward local input (stdin lines for terminals)
        #[arg(short, long)]
        interactive: bool,

        /// Save the last rendered frame on exit (defaults to the captures dir)
        #[arg(long)]
        capture: Option<Option<PathBuf>>,
    },

    /// Evaluate session activation over a workflow snapshot
    Track {
        /// JSON file holding a list of workflows
        #[arg(long)]
        tasks: PathBuf,

        /// Treat the assistant response as still streaming
        #[arg(long)]
        streaming: bool,

        /// Protocol family to track
        #[arg(short, long, default_value = "screencast")]
        family: String,

        /// Keep re-reading the file and mount the live session
        #[arg(long)]
        follow: bool,

        /// Re-read interval in milliseconds when following
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Watch {
            family,
            token,
            interactive,
            capture,
        } => {
            commands::watch::run(&family, &token, interactive, capture).await?;
        }
        Commands::Track {
            tasks,
            streaming,
            family,
            follow,
            interval_ms,
        } => {
            if follow {
                let interval = std::time::Duration::from_millis(interval_ms.max(100));
                commands::track::follow(&tasks, streaming, &family, interval).await?;
            } else {
                commands::track::run(&tasks, streaming, &family).await?;
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(force).await?;
            }
        },
    }

    Ok(())
}
