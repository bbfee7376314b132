//! Loomweave CLI entry point.
//!
//! Commands:
//! - `init`   Create the config file and data directories
//! - `serve`  Start the HTTP gateway
//! - `build`  Run the prompt pipeline once and print the result
//! - `merge`  Merge two JSON documents with the variable merge engine
//! - `tree`   Inspect and edit conversation trees

use clap::{Parser, Subcommand};

mod commands;

use commands::build::BuildArgs;
use commands::merge::MergeArgs;
use commands::tree::TreeCommand;

#[derive(Parser)]
#[command(
    name = "loomweave",
    about = "Loomweave: branching conversations and staged prompt assembly",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create ~/.loomweave/config.toml and the data directories
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Build a prompt and print the result as JSON
    Build(BuildArgs),

    /// Merge JSON documents and print the result
    Merge(MergeArgs),

    /// Conversation tree operations
    Tree {
        #[command(subcommand)]
        command: TreeCommand,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output on stdout stays clean
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Serve { port, host } => commands::serve::run(port, host).await?,
        Commands::Build(args) => commands::build::run(args).await?,
        Commands::Merge(args) => commands::merge::run(args)?,
        Commands::Tree { command } => commands::tree::run(command).await?,
    }

    Ok(())
}
