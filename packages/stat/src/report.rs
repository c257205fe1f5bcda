//! Plain-text summary of an aggregate.

use std::fmt::Write as _;
use std::time::Duration;

use taxi_geo_models::{region_name, report_regions};
use taxi_stat_models::{Counters, DISTANCE_BUCKETS, FARE_BUCKETS, StatAggregate, TRIP_TIME_BUCKETS};

const WIDTH: usize = 50;

/// Renders the report for `aggregate`, ending with the summary line
/// `Done, <valid>/<total> records in <secs> seconds by <N> processes.`
#[must_use]
pub fn render(aggregate: &StatAggregate, elapsed: Duration, processes: usize) -> String {
    let mut out = render_tables(aggregate);
    let _ = writeln!(
        out,
        "Done, {}/{} records in {:.2} seconds by {processes} processes.",
        aggregate.valid(),
        aggregate.total,
        elapsed.as_secs_f64()
    );
    out
}

/// Renders the title, borough table and histograms of `aggregate`.
#[must_use]
pub fn render_tables(aggregate: &StatAggregate) -> String {
    let mut out = String::new();
    let mut chars = aggregate.category.as_ref().chars();
    let capitalized: String = chars
        .next()
        .map(|c| c.to_uppercase().chain(chars).collect())
        .unwrap_or_default();

    heading(
        &mut out,
        &format!(" NYC {capitalized} Cab, {} ", aggregate.period.long_name()),
        '=',
    );
    let _ = writeln!(out, "{:>14}: {:>16} {:>16}", "Borough", "Pickups", "Dropoffs");
    for region in report_regions() {
        let _ = writeln!(
            out,
            "{:>14}: {:>16} {:>16}",
            region_name(region),
            count(&aggregate.region_pickups, region),
            count(&aggregate.region_dropoffs, region)
        );
    }

    heading(&mut out, " Pickup Time ", '-');
    for (&hour, &n) in &aggregate.hour {
        row(&mut out, &format!("{hour}:00 ~ {hour}:59"), n);
    }

    heading(&mut out, " Trip Distance (miles) ", '-');
    histogram(&mut out, &aggregate.distance, &DISTANCE_BUCKETS, 1);

    heading(&mut out, " Trip Time (minutes) ", '-');
    histogram(&mut out, &aggregate.trip_time, &TRIP_TIME_BUCKETS, 60);

    heading(&mut out, " Fare (dollars) ", '-');
    histogram(&mut out, &aggregate.fare, &FARE_BUCKETS, 1);

    heading(&mut out, "", '=');
    out
}

fn heading(out: &mut String, title: &str, fill: char) {
    let pad = WIDTH.saturating_sub(title.chars().count());
    let left = pad / 2;
    let fill = fill.to_string();
    let _ = writeln!(out, "{}{title}{}", fill.repeat(left), fill.repeat(pad - left));
}

fn row(out: &mut String, label: &str, n: u64) {
    let _ = writeln!(out, "{label:>14}: {n:>33}");
}

/// One row per bucket, labelled `a ~ b` and `> last` in `bounds / unit`.
fn histogram(out: &mut String, counters: &Counters, bounds: &[u32], unit: u32) {
    for (i, &lower) in bounds.iter().enumerate() {
        let label = bounds.get(i + 1).map_or_else(
            || format!("> {}", lower / unit),
            |upper| format!("{} ~ {}", lower / unit, upper / unit),
        );
        row(out, &label, count(counters, lower));
    }
}

fn count(counters: &Counters, key: u32) -> u64 {
    counters.get(&key).copied().unwrap_or(0)
}
