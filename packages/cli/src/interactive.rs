//! Menu shown when `taxi` runs without a subcommand.

use dialoguer::{Confirm, Input, Select};
use taxi_trip_models::{Category, Period};

use crate::commands::{
    self, CliResult, ConvertArgs, LocateArgs, PeriodArgs, RunArgs, StatsCommand, TasksCommand,
    WorkerArgs,
};
use crate::context::Context;

enum Action {
    Convert,
    Run,
    Worker,
    ListSources,
    SubmitTasks,
    QueueDepth,
    ShowStats,
    Locate,
}

impl Action {
    const ALL: &[Self] = &[
        Self::Convert,
        Self::Run,
        Self::Worker,
        Self::ListSources,
        Self::SubmitTasks,
        Self::QueueDepth,
        Self::ShowStats,
        Self::Locate,
    ];

    #[must_use]
    const fn label(&self) -> &'static str {
        match self {
            Self::Convert => "Convert raw monthly files",
            Self::Run => "Scan a month",
            Self::Worker => "Start a worker",
            Self::ListSources => "List converted months",
            Self::SubmitTasks => "Submit tasks for a month",
            Self::QueueDepth => "Show queue depth",
            Self::ShowStats => "Show stored statistics",
            Self::Locate => "Locate a point",
        }
    }
}

/// Prompts for an action and its arguments, then runs it.
///
/// # Errors
///
/// Returns an error if a prompt fails or the selected command fails.
pub async fn run(ctx: &Context) -> CliResult {
    let labels: Vec<&str> = Action::ALL.iter().map(Action::label).collect();

    let idx = Select::new()
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;

    match Action::ALL[idx] {
        Action::Convert => {
            let category = prompt_category(Category::Yellow)?;
            let from: Period = Input::new()
                .with_prompt("First month (YYYY-MM)")
                .default(category.min_period())
                .interact_text()?;
            let to: Period = Input::new()
                .with_prompt("Last month (YYYY-MM)")
                .default(from)
                .interact_text()?;
            let max_lines = prompt_optional_u64("Records per month (empty for all)")?;
            let skip_unchanged = Confirm::new()
                .with_prompt("Skip months already uploaded unchanged?")
                .default(true)
                .interact()?;
            let args = ConvertArgs {
                category,
                from,
                to,
                source: None,
                dest: None,
                max_lines,
                no_tagging: false,
                procs: prompt_procs()?,
                cross_account: false,
                skip_unchanged,
            };
            commands::convert(ctx, &args).await
        }
        Action::Run => {
            let period = prompt_period()?;
            let procs = prompt_procs()?;
            let dry_run = !Confirm::new()
                .with_prompt("Commit the results?")
                .default(true)
                .interact()?;
            let args = RunArgs {
                period,
                start: 0,
                end: u64::MAX,
                procs,
                report: true,
                dry_run,
            };
            commands::run(ctx, &args).await
        }
        Action::Worker => {
            let args = WorkerArgs {
                procs: Some(prompt_procs()?),
                sleep: None,
            };
            commands::worker(ctx, &args).await
        }
        Action::ListSources => {
            let command = TasksCommand::Sources {
                category: prompt_category(Category::Green)?,
            };
            commands::tasks(ctx, &command).await
        }
        Action::SubmitTasks => {
            let period = prompt_period()?;
            let dry_run = !Confirm::new()
                .with_prompt(format!("Enqueue to {}?", ctx.settings.queue))
                .default(true)
                .interact()?;
            let command = TasksCommand::Create {
                period,
                count: None,
                dry_run,
            };
            commands::tasks(ctx, &command).await
        }
        Action::QueueDepth => commands::tasks(ctx, &TasksCommand::Count).await,
        Action::ShowStats => {
            let command = StatsCommand::Show {
                period: prompt_period()?,
                json: false,
            };
            commands::stats(ctx, &command).await
        }
        Action::Locate => {
            let longitude: f64 = Input::new()
                .with_prompt("Longitude")
                .default(-73.985)
                .interact_text()?;
            let latitude: f64 = Input::new()
                .with_prompt("Latitude")
                .default(40.758)
                .interact_text()?;
            commands::locate(
                ctx,
                &LocateArgs {
                    longitude,
                    latitude,
                },
            )
        }
    }
}

fn prompt_category(default: Category) -> Result<Category, Box<dyn std::error::Error>> {
    let idx = Select::new()
        .with_prompt("Trip category")
        .items(Category::all())
        .default(Category::all().iter().position(|c| *c == default).unwrap_or(0))
        .interact()?;
    Ok(Category::all()[idx])
}

fn prompt_period() -> Result<PeriodArgs, Box<dyn std::error::Error>> {
    let category = prompt_category(Category::Green)?;
    let year: i32 = Input::new()
        .with_prompt("Year")
        .default(2016)
        .interact_text()?;
    let month: u32 = Input::new()
        .with_prompt("Month")
        .default(1)
        .interact_text()?;
    Ok(PeriodArgs {
        category,
        year,
        month,
    })
}

fn prompt_procs() -> Result<usize, Box<dyn std::error::Error>> {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    Ok(Input::new()
        .with_prompt("Processes")
        .default(cores)
        .interact_text()?)
}

fn prompt_optional_u64(prompt: &str) -> Result<Option<u64>, Box<dyn std::error::Error>> {
    let input: String = Input::new()
        .with_prompt(prompt)
        .allow_empty(true)
        .interact_text()?;

    if input.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(input.trim().parse()?))
    }
}
