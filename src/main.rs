//! cosign CLI Application
//!
//! A command-line interface for co-signer keys, configuration and
//! in-process signing simulations.

use clap::{Parser, Subcommand};
use musig_cosign::cli;
use musig_cosign::CoordinatorConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cosign")]
#[command(version = "0.1.0")]
#[command(about = "MuSig2 co-signer discovery and session coordination", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "cosign.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a session key pair
    Keygen,

    /// Configuration file operations
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Run an n-of-n signing session between in-process co-signers
    Simulate {
        /// Number of co-signers, including the initiator
        #[arg(short, long, default_value = "3")]
        signers: usize,

        /// Index of a co-signer to take offline before the session starts
        #[arg(long)]
        offline: Option<usize>,

        /// Save the initiator's session history to the data directory
        #[arg(long)]
        record: bool,
    },

    /// Show recorded signing sessions
    History {
        /// Data directory (defaults to the configured one)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => cli::cmd_keygen()?,

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => cli::cmd_config_init(&cli.config, force)?,
            ConfigCommands::Show => cli::cmd_config_show(&cli.config)?,
        },

        Commands::Simulate {
            signers,
            offline,
            record,
        } => {
            let config = CoordinatorConfig::load_or_default(&cli.config)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_simulate(&config, signers, offline, record))?;
        }

        Commands::History { data_dir } => {
            let data_dir = match data_dir {
                Some(dir) => dir,
                None => CoordinatorConfig::load_or_default(&cli.config)?.data_dir,
            };
            cli::cmd_history(&data_dir)?;
        }
    }

    Ok(())
}
