//! modschema - command line tool for modbus schemas
//!
//! Verifies the tests embedded in a schema, shows what a schema defines,
//! replays register dumps through the full update cycle and writes the
//! normalized schema back out.

mod replay;
mod schema;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::logging::{self, LogConfig};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "modschema")]
#[command(about = "Verify, inspect and replay modbus device schemas")]
#[command(long_about = "Verify, inspect and replay modbus device schemas

Commands:
  verify      Run the tests embedded in a schema
  describe    Show the blocks and fields of a schema
  replay      Decode register dumps with a schema
  export      Write the normalized schema

Examples:
  modschema verify meter.yaml
  modschema replay meter.yaml --input hr:0=holding.txt --input ir:0=input.txt
  modschema replay meter.yaml --input hr:0=holding.txt --cycles 3 --max-age 0
  modschema export meter.yaml --output normalized.yaml")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Runtime config file (YAML, TOML or JSON)
    #[arg(short = 'c', long, global = true, env = "MODSCHEMA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests embedded in a schema
    Verify {
        /// Schema file
        schema: PathBuf,
    },

    /// Show the blocks and fields of a schema
    Describe {
        /// Schema file
        schema: PathBuf,
    },

    /// Decode register dumps with a schema
    Replay {
        /// Schema file
        schema: PathBuf,

        /// Register dump as `<first address>=<file>`, e.g. `hr:0=holding.txt`
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,

        /// Number of update cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: usize,

        /// Maximum age of cached values in milliseconds, applies from the second cycle
        #[arg(long)]
        max_age: Option<u64>,
    },

    /// Write the normalized schema
    Export {
        /// Schema file
        schema: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure colored output
    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = common::load_config(cli.config.as_deref())
        .with_context(|| "Unable to load the runtime configuration")?;

    let console_level = if cli.verbose {
        Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(Level::INFO)
    };
    logging::init_with_config(LogConfig {
        console_level,
        enable_file: config.log_dir.is_some(),
        log_dir: config.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs")),
        ansi: !cli.no_color,
        ..Default::default()
    })?;

    match cli.command {
        Commands::Verify { schema } => {
            if !schema::verify_command(&schema).await? {
                std::process::exit(1);
            }
        },
        Commands::Describe { schema } => {
            schema::describe_command(&schema).await?;
        },
        Commands::Replay {
            schema,
            inputs,
            cycles,
            max_age,
        } => {
            replay::replay_command(&schema, &inputs, cycles, max_age, &config).await?;
        },
        Commands::Export { schema, output } => {
            schema::export_command(&schema, output.as_deref()).await?;
        },
    }

    Ok(())
}
