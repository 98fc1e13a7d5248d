mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, runs::RunsSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Roll branch-rendered configuration out to network devices, durably",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file
    #[arg(
        long,
        global = true,
        env = "ROLLOUT_CONFIG",
        default_value = "rollout.yaml"
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server and the rollout engine, resuming unfinished runs
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long, env = "ROLLOUT_BIND")]
        bind: Option<String>,
        /// Run database path (overrides engine.database)
        #[arg(long, env = "ROLLOUT_DB")]
        db: Option<PathBuf>,
    },

    /// Show which devices a branch changes relative to the baseline
    Diff {
        branch: String,
        /// Compare against this branch instead of store.baseline_branch
        #[arg(long)]
        baseline: Option<String>,
    },

    /// Inspect recorded runs
    Runs {
        /// Run database path (overrides engine.database)
        #[arg(long, global = true, env = "ROLLOUT_DB")]
        db: Option<PathBuf>,
        #[command(subcommand)]
        subcommand: RunsSubcommand,
    },

    /// Create or validate the configuration file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve { bind, db } => cmd::serve::run(&cli.config, bind, db),
        Commands::Diff { branch, baseline } => {
            cmd::diff::run(&cli.config, &branch, baseline.as_deref(), cli.json)
        }
        Commands::Runs { db, subcommand } => cmd::runs::run(&cli.config, db, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
