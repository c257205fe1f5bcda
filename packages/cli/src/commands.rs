//! Subcommand arguments and handlers.

use std::time::Duration;

use clap::{Args, Subcommand};
use taxi_cli_utils::IndicatifProgress;
use taxi_database::StatStore as _;
use taxi_geo::nearest_borough_center;
use taxi_geo_models::region_name;
use taxi_orchestrator::{SubmitOptions, WorkerOptions, receive_tasks, submit_tasks};
use taxi_queue::TaskQueue as _;
use taxi_stat::report;
use taxi_trip::convert::{ConvertOptions, Destination, RawSource};
use taxi_trip_models::{Category, ModelError, Period};

use crate::context::Context;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid range [{start}, {end}]")]
    InvalidRange { start: u64, end: u64 },

    #[error("Interrupted")]
    Interrupted,
}

/// Selects one monthly file.
#[derive(Args, Debug, Clone)]
pub struct PeriodArgs {
    /// Trip category (yellow|green)
    #[arg(short, long, default_value = "green")]
    pub category: Category,
    /// Year of record
    #[arg(short, long, default_value_t = 2016)]
    pub year: i32,
    /// Month of record
    #[arg(short, long, default_value_t = 1)]
    pub month: u32,
}

impl PeriodArgs {
    /// Validates the month against the category's published range.
    pub fn resolve(&self) -> Result<(Category, Period), ModelError> {
        let period = Period::new(self.year, self.month)?;
        self.category.validate(period)?;
        Ok((self.category, period))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Trip category (yellow|green)
    #[arg(short, long, default_value = "yellow")]
    pub category: Category,
    /// First month (YYYY-MM)
    #[arg(long, default_value = "2016-01")]
    pub from: Period,
    /// Last month, inclusive (YYYY-MM)
    #[arg(long, default_value = "2016-01")]
    pub to: Period,
    /// Raw source: http(s):// base URL, file:// directory, or - for stdin
    #[arg(long)]
    pub source: Option<String>,
    /// Destination: file:// directory, s3:// bucket, or - for stdout
    #[arg(long)]
    pub dest: Option<String>,
    /// Maximum records written per month
    #[arg(long)]
    pub max_lines: Option<u64>,
    /// Skip tagging uploaded objects
    #[arg(long)]
    pub no_tagging: bool,
    /// Months converted concurrently
    #[arg(short, long, default_value_t = 1)]
    pub procs: usize,
    /// Grant the bucket owner full control of uploads
    #[arg(long)]
    pub cross_account: bool,
    /// Skip uploads whose stored object already matches
    #[arg(long)]
    pub skip_unchanged: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub period: PeriodArgs,
    /// First record index
    #[arg(short, long, default_value_t = 0)]
    pub start: u64,
    /// Last record index (clamped to the file length)
    #[arg(short, long, default_value_t = u64::MAX)]
    pub end: u64,
    /// Concurrent scan parts
    #[arg(short, long, default_value_t = 1)]
    pub procs: usize,
    /// Print the statistics report
    #[arg(short, long)]
    pub report: bool,
    /// Scan without committing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Concurrent scan parts per task (default: available cores)
    #[arg(short, long)]
    pub procs: Option<usize>,
    /// Seconds to sleep when the queue is empty
    #[arg(long)]
    pub sleep: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TasksCommand {
    /// Split a month into tasks and enqueue them
    Create {
        #[command(flatten)]
        period: PeriodArgs,
        /// Number of tasks (default: derived from records_per_task)
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Log the tasks without enqueueing
        #[arg(long)]
        dry_run: bool,
    },
    /// Lease tasks and print them
    Receive {
        /// Number of tasks to receive
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Delete each task after receiving it
        #[arg(long)]
        delete: bool,
    },
    /// Print visible and in-flight task counts
    Count,
    /// List months with normalized files to submit
    Sources {
        /// Trip category (yellow|green)
        #[arg(short, long, default_value = "green")]
        category: Category,
    },
    /// Remove every task
    Purge,
}

#[derive(Subcommand, Debug, Clone)]
pub enum StatsCommand {
    /// Print the stored statistics of one month
    Show {
        #[command(flatten)]
        period: PeriodArgs,
        /// Print JSON instead of the text report
        #[arg(long)]
        json: bool,
    },
    /// List months with stored statistics
    List {
        /// Trip category (yellow|green)
        #[arg(short, long, default_value = "green")]
        category: Category,
    },
    /// Delete all stored statistics of a category
    Purge {
        /// Trip category (yellow|green)
        #[arg(short, long)]
        category: Category,
    },
}

#[derive(Args, Debug, Clone)]
pub struct LocateArgs {
    /// Longitude
    #[arg(allow_negative_numbers = true)]
    pub longitude: f64,
    /// Latitude
    #[arg(allow_negative_numbers = true)]
    pub latitude: f64,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Converts raw monthly files into normalized fixed-width files.
pub async fn convert(ctx: &Context, args: &ConvertArgs) -> CliResult {
    let source = RawSource::parse(args.source.as_deref().unwrap_or(&ctx.settings.raw_source))?;
    let destination = Destination::open(
        args.dest.as_deref().unwrap_or(&ctx.settings.bucket),
        &ctx.settings.region,
    )
    .await?;

    let months = args.from.through(args.to).count() as u64;
    let progress = IndicatifProgress::steps_bar(&ctx.multi, "converting", months);
    let options = ConvertOptions {
        category: args.category,
        start: args.from,
        end: args.to,
        source,
        destination,
        max_lines: args.max_lines,
        tagging: !args.no_tagging,
        procs: args.procs.max(1),
        cross_account: args.cross_account,
        skip_unchanged: args.skip_unchanged,
    };

    let stats = tokio::select! {
        stats = taxi_trip::convert::convert(options, progress) => stats?,
        () = ctx.cancel.cancelled() => return Err(CliError::Interrupted.into()),
    };

    for month in &stats {
        log::info!(
            "{}-{} => {} ({} read, {} written, {} rejected){}",
            args.category,
            month.period,
            month.output,
            month.read,
            month.written,
            month.rejected,
            if month.unchanged { " unchanged" } else { "" }
        );
    }
    Ok(())
}

/// Scans one record range and commits (or, on a dry run, only reports)
/// the result.
pub async fn run(ctx: &Context, args: &RunArgs) -> CliResult {
    let (category, period) = args.period.resolve()?;
    if args.start > args.end {
        return Err(CliError::InvalidRange {
            start: args.start,
            end: args.end,
        }
        .into());
    }

    let orchestrator = ctx.orchestrator().await?;
    let spinner = IndicatifProgress::spinner(
        &ctx.multi,
        &format!("scanning {category}-{period} with {} parts", args.procs),
    );
    let result = if args.dry_run {
        orchestrator
            .scan_range(category, period, args.start, args.end, args.procs)
            .await
    } else {
        orchestrator
            .run_range(category, period, args.start, args.end, args.procs)
            .await
    };
    let scan = match result {
        Ok(scan) => scan,
        Err(e) => {
            spinner.finish(format!("{category}-{period} failed"));
            return Err(e.into());
        }
    };
    spinner.finish(format!("{category}-{period}: {} records", scan.aggregate.total));

    if scan.malformed > 0 {
        log::warn!("{}: {} malformed records skipped", scan.source, scan.malformed);
    }
    if args.report {
        print!(
            "{}",
            report::render(&scan.aggregate, scan.elapsed, scan.parts)
        );
    } else {
        log::info!(
            "Done, {}/{} records in {:.2} seconds by {} processes.",
            scan.aggregate.valid(),
            scan.aggregate.total,
            scan.elapsed.as_secs_f64(),
            scan.parts
        );
    }
    Ok(())
}

/// Processes queued tasks until interrupted.
pub async fn worker(ctx: &Context, args: &WorkerArgs) -> CliResult {
    let orchestrator = ctx.orchestrator().await?;
    let queue = ctx.queue().await?;
    let options = WorkerOptions {
        poll_interval: args
            .sleep
            .map_or_else(|| ctx.settings.poll_interval(), Duration::from_secs),
        lease_wait: ctx.settings.lease_wait(),
        parallelism: args.procs.unwrap_or_else(default_parallelism),
    };

    let stats = orchestrator.run_worker_loop(queue.as_ref(), options).await;
    println!(
        "Worker stopped: {} completed, {} failed, {} duplicates",
        stats.completed, stats.failed, stats.duplicates
    );
    Ok(())
}

/// Task queue management.
pub async fn tasks(ctx: &Context, command: &TasksCommand) -> CliResult {
    if let TasksCommand::Sources { category } = command {
        let source = ctx.source_store().await?;
        let periods = taxi_trip::available_periods(source.as_ref(), *category).await?;
        if periods.is_empty() {
            println!("No {category} files in {}", source.uri());
        }
        for period in periods {
            let records = taxi_trip::record_count(source.as_ref(), *category, period).await?;
            println!("{category}-{period} {records}");
        }
        return Ok(());
    }

    let queue = ctx.queue().await?;
    match command {
        TasksCommand::Create {
            period,
            count,
            dry_run,
        } => {
            let (category, period) = period.resolve()?;
            let source = ctx.source_store().await?;
            let tasks = submit_tasks(
                source.as_ref(),
                queue.as_ref(),
                category,
                period,
                &SubmitOptions {
                    n_tasks: *count,
                    records_per_task: ctx.settings.records_per_task,
                    timeout_secs: ctx.settings.task_timeout,
                    dry_run: *dry_run,
                },
            )
            .await?;
            for task in &tasks {
                println!("{} {task}", if *dry_run { "would create" } else { "created" });
            }
        }
        TasksCommand::Receive { count, delete } => {
            let tasks =
                receive_tasks(queue.as_ref(), *count, *delete, ctx.settings.lease_wait()).await?;
            if tasks.is_empty() {
                println!("received none");
            }
            for task in &tasks {
                println!("received {task}");
            }
        }
        TasksCommand::Sources { .. } => {}
        TasksCommand::Count => {
            let depth = queue.depth().await?;
            println!("Tasks remain: {}, retry: {}", depth.visible, depth.in_flight);
        }
        TasksCommand::Purge => {
            queue.purge().await?;
            println!("Purged {}", queue.name());
        }
    }
    Ok(())
}

/// Stored statistics inspection.
pub async fn stats(ctx: &Context, command: &StatsCommand) -> CliResult {
    let store = ctx.stat_store()?;
    match command {
        StatsCommand::Show { period, json } => {
            let (category, period) = period.resolve()?;
            let aggregate = store.try_get(category, period).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&aggregate)?);
            } else {
                print!("{}", report::render_tables(&aggregate));
                println!(
                    "{}/{} records stored in {}",
                    aggregate.valid(),
                    aggregate.total,
                    ctx.stat_db_path().display()
                );
            }
        }
        StatsCommand::List { category } => {
            for period in store.periods(*category).await? {
                println!("{category}-{period}");
            }
        }
        StatsCommand::Purge { category } => {
            let removed = store.purge(*category).await?;
            println!("Purged {removed} {category} counters");
        }
    }
    Ok(())
}

/// Prints the district containing a point, or the nearest borough center.
pub fn locate(ctx: &Context, args: &LocateArgs) -> CliResult {
    let geo = ctx.geo()?;
    match geo.locate(args.longitude, args.latitude) {
        Some(district) => println!("{district} ({})", region_name(district.region())),
        None => {
            let borough = nearest_borough_center(args.longitude, args.latitude);
            println!(
                "No district; nearest borough center: {}",
                region_name(borough)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: Harnessed,
    }

    #[derive(Subcommand)]
    enum Harnessed {
        Run(RunArgs),
        Locate(LocateArgs),
        #[command(subcommand)]
        Tasks(TasksCommand),
    }

    #[test]
    fn run_defaults_match_single_process_full_file() {
        let Harnessed::Run(args) = Harness::parse_from(["taxi", "run"]).command else {
            panic!("expected run");
        };
        assert_eq!(args.start, 0);
        assert_eq!(args.end, u64::MAX);
        assert_eq!(args.procs, 1);
        assert_eq!(
            args.period.resolve().unwrap(),
            (Category::Green, Period::new(2016, 1).unwrap())
        );
    }

    #[test]
    fn period_outside_category_range_is_rejected() {
        let Harnessed::Run(args) =
            Harness::parse_from(["taxi", "run", "-c", "green", "-y", "2012", "-m", "5"]).command
        else {
            panic!("expected run");
        };
        assert!(matches!(
            args.period.resolve(),
            Err(ModelError::OutOfRange { .. })
        ));
    }

    #[test]
    fn locate_accepts_negative_longitude() {
        let Harnessed::Locate(args) =
            Harness::parse_from(["taxi", "locate", "-73.98", "40.75"]).command
        else {
            panic!("expected locate");
        };
        assert!((args.longitude + 73.98).abs() < f64::EPSILON);
    }

    #[test]
    fn tasks_create_takes_count() {
        let Harnessed::Tasks(TasksCommand::Create { count, period, .. }) = Harness::parse_from([
            "taxi", "tasks", "create", "-c", "yellow", "-m", "3", "-n", "8",
        ])
        .command
        else {
            panic!("expected tasks create");
        };
        assert_eq!(count, Some(8));
        assert_eq!(period.category, Category::Yellow);
    }
}
