use std::path::PathBuf;

use clap::{Parser, Subcommand};
use espbatch::{
    cli::{self, FlashArgs, HistoryArgs},
    logging::initialize_logger,
    Config,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the currently attached serial ports
    ListPorts,
    /// Flash a firmware image to one or more devices, sequentially
    Flash(FlashArgs),
    /// Show the device provenance registry
    History(HistoryArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse();
    debug!("{:#?}", args);

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.subcommand {
        Commands::ListPorts => cli::list_ports(&config),
        Commands::Flash(flash_args) => cli::flash(flash_args, &config),
        Commands::History(history_args) => cli::history(history_args, &config),
    }
}
