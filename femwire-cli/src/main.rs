//! femwire-cli - Command-line interface for femwire engines
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use femwire_client::{ClientConfig, Session};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "femwire-cli")]
#[command(about = "Command-line interface for femwire simulation engines")]
#[command(version)]
struct Cli {
    /// Engine address (overrides FEMWIRE_ADDR and the config file)
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Run against a private in-process engine instead of a TCP one
    #[arg(long)]
    local: bool,

    /// Transfer chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Let an in-flight engine call finish when Ctrl-C is pressed
    #[arg(long)]
    defer_interrupts: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the engine
    Ping,

    /// Run one engine command and print its output
    Run {
        /// Command line, e.g. "*VEC,V,D,ALLOC,10"
        command: String,
    },

    /// Read a scalar parameter
    Param {
        /// Parameter name
        name: String,
    },

    /// Show metadata of a workspace object
    Info {
        /// Object name
        name: String,
    },

    /// Download and print a vector or matrix
    Show {
        /// Object name
        name: String,
    },

    /// Show the workspace status listing
    Status,

    /// Summarize the engine mesh
    Mesh,

    /// List files in the engine working directory
    Files,

    /// Upload a local file
    Upload {
        /// Local path
        path: PathBuf,
    },

    /// Download an engine file
    Download {
        /// Engine file name
        filename: String,

        /// Destination path or directory
        #[arg(default_value = ".")]
        dest: PathBuf,
    },
}

fn open_session(cli: &Cli) -> Result<Session, Box<dyn std::error::Error>> {
    let mut config = ClientConfig::load()?;
    if let Some(addr) = cli.server {
        config.engine.addr = addr;
    }
    if let Some(size) = cli.chunk_size {
        config.transfer.chunk_size = size;
    }
    if cli.defer_interrupts {
        config.engine.defer_interrupts = true;
    }
    config.engine.client_name = Some("femwire-cli".to_string());

    let session = if cli.local {
        tracing::debug!("Starting in-process engine");
        femwire_sim::local_session(&femwire_sim::EngineConfig::default(), &config)?
    } else {
        tracing::debug!("Connecting to {}", config.engine.addr);
        Session::connect(&config)?
    };
    Ok(session)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let session = open_session(&cli).map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&session)?;
        }
        Some(cmd) => match commands::execute(&session, cmd) {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                let _ = session.exit();
                std::process::exit(1);
            }
        },
    }

    session.exit()?;
    Ok(())
}
