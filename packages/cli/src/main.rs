#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `taxi`: NYC taxi trip statistics pipeline.
//!
//! Converts raw monthly trip files into fixed-width records, scans record
//! ranges in parallel into per-district statistics, and runs queue-driven
//! workers. Without a subcommand an interactive menu is shown.
//!
//! Uses `indicatif-log-bridge` (via [`taxi_cli_utils::init_logger`]) so
//! log lines and progress bars share the terminal. Ctrl-C cancels the
//! running scan or worker loop without committing partial results.

mod commands;
mod context;
mod interactive;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use taxi_config::{Profile, Settings};
use tokio_util::sync::CancellationToken;

use crate::commands::{
    ConvertArgs, LocateArgs, RunArgs, StatsCommand, TasksCommand, WorkerArgs,
};
use crate::context::Context;

#[derive(Parser)]
#[command(name = "taxi", about = "NYC taxi trip statistics pipeline")]
struct Cli {
    /// Use the debug settings profile
    #[arg(short, long, global = true)]
    debug: bool,
    /// Settings file layered over the built-in profiles
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert raw monthly CSV files into normalized fixed-width files
    Convert(ConvertArgs),
    /// Scan a record range and commit its statistics
    Run(RunArgs),
    /// Process queued tasks until interrupted
    Worker(WorkerArgs),
    /// Manage the task queue
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Inspect stored statistics
    #[command(subcommand)]
    Stats(StatsCommand),
    /// Find the district containing a point
    Locate(LocateArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = taxi_cli_utils::init_logger();
    let cli = Cli::parse();

    let profile = if cli.debug {
        Profile::Debug
    } else {
        Profile::Default
    };
    let settings = Settings::load(profile, cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping...");
                cancel.cancel();
            }
        });
    }

    let ctx = Context::new(settings, multi, cancel);

    let Some(command) = cli.command else {
        return interactive::run(&ctx).await;
    };

    match command {
        Commands::Convert(args) => commands::convert(&ctx, &args).await?,
        Commands::Run(args) => commands::run(&ctx, &args).await?,
        Commands::Worker(args) => commands::worker(&ctx, &args).await?,
        Commands::Tasks(command) => commands::tasks(&ctx, &command).await?,
        Commands::Stats(command) => commands::stats(&ctx, &command).await?,
        Commands::Locate(args) => commands::locate(&ctx, &args)?,
    }

    Ok(())
}
