// this_file: src/main.rs
//! Threadstore CLI - exercise thread-local slots and inspect the debug registry

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::io::{self, Read};
use threadstore::logging;
use threadstore::registry::AllocationTable;
use threadstore::workload::{self, WorkloadSpec};

/// Threadstore - per-thread buffer cache diagnostics
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, default_value = "info")]
    log_level: String,

    /// Enable quiet mode (only errors)
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a JSON workload specification and print a JSON report
    Run {
        /// Input file (uses stdin if not specified)
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Run the default workload and print registry tables
    Show {
        /// Which view to print
        #[arg(value_enum)]
        view: View,

        /// Number of worker threads
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// Buffer size requested by every slot
        #[arg(short, long, default_value_t = 1024)]
        size: usize,
    },

    /// Validate a JSON workload specification
    Validate {
        /// Input file (uses stdin if not specified)
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum View {
    /// Every live allocation
    Allocations,
    /// Allocations grouped by call site
    Summary,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&cli.log_level, cli.quiet, true);

    match cli.command {
        Commands::Run { input } => run_spec(input)?,
        Commands::Show {
            view,
            threads,
            size,
        } => show(view, threads, size)?,
        Commands::Validate { input } => validate_spec(input)?,
        Commands::Version => {
            println!("threadstore version {}", threadstore::VERSION);
            println!(
                "debug registry: {}",
                if threadstore::tracker().is_enabled() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
    }

    Ok(())
}

fn read_input(input: Option<String>) -> Result<String> {
    Ok(match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    })
}

/// Run a workload from a file or stdin
fn run_spec(input: Option<String>) -> Result<()> {
    let json = read_input(input)?;
    let spec = match workload::parse_workload(&json) {
        Ok(spec) => spec,
        Err(e) => {
            error!("Failed to parse workload specification: {}", e);
            return Err(e.into());
        }
    };

    info!("Running workload with {} threads", spec.threads);
    let report = workload::run_workload(&spec)?;
    println!("{}", serde_json::to_string(&report)?);

    if !report.leaked.is_empty() || report.bytes_outstanding != 0 {
        anyhow::bail!(
            "{} registry entries and {} bytes outlived their threads",
            report.leaked.len(),
            report.bytes_outstanding
        );
    }
    Ok(())
}

/// Print the registry the way an operator console would
fn show(view: View, threads: usize, size: usize) -> Result<()> {
    let report = workload::run_workload(&WorkloadSpec::uniform(threads, size))?;

    if !report.registry_enabled {
        println!("debug registry disabled; rebuild with --features debug-registry");
        return Ok(());
    }

    match view {
        View::Allocations => println!("{}", AllocationTable(&report.live)),
        View::Summary => println!("{}", report.summary),
    }
    for failure in &report.failures {
        println!("failure: {}", failure);
    }
    Ok(())
}

/// Validate a workload specification
fn validate_spec(input: Option<String>) -> Result<()> {
    let json = read_input(input)?;

    match workload::parse_workload(&json) {
        Ok(spec) => {
            println!("✓ Valid workload specification");
            println!("  Threads: {}", spec.threads);
            println!("  Touches: {}", spec.touches);
            println!("  Slots: {}", spec.slots.len());
            Ok(())
        }
        Err(e) => {
            println!("✗ Invalid workload specification: {}", e);
            Err(e.into())
        }
    }
}
