use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "ontextract")]
#[command(version, about = "LLM orchestration for semantic-change experiments")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "ONTEXTRACT_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .ontextract/ with a default config and an empty database
    Init,
    /// Run the HTTP orchestration service
    Serve {
        /// Port to listen on (overrides ontextract.toml)
        #[arg(long)]
        port: Option<u16>,
        /// SQLite database path (overrides ontextract.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Bind 0.0.0.0 and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Print the status view of a run
    Status {
        run_id: String,
    },
    /// List the runs of an experiment
    Runs {
        experiment_id: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default ontextract.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&project_dir, cli.verbose, *port, db_path.clone(), *dev).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Status { run_id } => cmd::cmd_status(&project_dir, run_id)?,
        Commands::Runs { experiment_id } => cmd::cmd_runs(&project_dir, *experiment_id)?,
    }

    Ok(())
}
