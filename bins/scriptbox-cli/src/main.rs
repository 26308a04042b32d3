mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scriptbox-cli")]
#[command(about = "Scriptbox CLI - Inspect scripts and resource profiles offline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recommend a resource profile and execution mode for a script
    Analyze {
        /// Script file to analyze
        #[arg(short, long)]
        file: PathBuf,

        /// Assume a GPU is available
        #[arg(long, default_value = "false")]
        gpu: bool,

        /// Analyzer rule tables (JSON) replacing the built-in ones
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Print the full analysis as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List the resource profiles
    Profiles {
        /// Profile file; built-in profiles when absent
        #[arg(short, long, default_value = "config/profiles.json")]
        config: PathBuf,
    },

    /// Show the effective limits for a profile with optional overrides
    Resolve {
        /// Profile name (small, medium, large, gpu)
        #[arg(short, long)]
        profile: String,

        /// Profile file; built-in profiles when absent
        #[arg(short, long, default_value = "config/profiles.json")]
        config: PathBuf,

        /// Memory ceiling override in MB
        #[arg(long)]
        memory_mb: Option<u32>,

        /// CPU share weight override
        #[arg(long)]
        cpu_shares: Option<u32>,

        /// Timeout override in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            file,
            gpu,
            rules,
            json,
        } => {
            commands::analyze_file(&file, gpu, rules.as_deref(), json)?;
        }
        Commands::Profiles { config } => {
            commands::list_profiles(&config)?;
        }
        Commands::Resolve {
            profile,
            config,
            memory_mb,
            cpu_shares,
            timeout,
        } => {
            commands::resolve_limits(&profile, &config, memory_mb, cpu_shares, timeout)?;
        }
    }

    Ok(())
}
