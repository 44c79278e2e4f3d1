use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::commands;

#[derive(Parser)]
#[command(
    name = "qdq-fold",
    version,
    about = "Fold fake-quantized ONNX weights into integer initializers",
    long_about = "Replace constant QuantizeLinear -> DequantizeLinear weight chains with \
                  precomputed INT8/UINT8/INT4 initializers so runtimes can execute \
                  integer kernels directly"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fold a model in place
    Convert {
        #[arg(value_name = "MODEL")]
        input: String,
    },

    /// Fold several models in place
    Batch {
        #[arg(value_name = "MODELS", required = true)]
        inputs: Vec<String>,

        #[arg(long)]
        continue_on_error: bool,
    },

    /// Show model structure and foldable sites
    Info {
        #[arg(value_name = "MODEL")]
        input: String,
    },

    /// Check graph connectivity and report remaining QDQ weight chains
    Check {
        #[arg(value_name = "MODEL")]
        input: String,
    },

    /// Convert the models listed in a YAML or TOML file
    Config {
        #[arg(value_name = "CONFIG")]
        config_file: String,

        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    println!("{}", format!("qdq-fold v{}", qdq_fold::VERSION).bold().cyan());
    println!();

    match cli.command {
        Commands::Convert { input } => {
            commands::convert(&input)?;
        }
        Commands::Batch {
            inputs,
            continue_on_error,
        } => {
            commands::batch(&inputs, continue_on_error)?;
        }
        Commands::Info { input } => {
            commands::info(&input)?;
        }
        Commands::Check { input } => {
            commands::check(&input)?;
        }
        Commands::Config { config_file, dry_run } => {
            commands::run_config(&config_file, dry_run)?;
        }
    }

    Ok(())
}
