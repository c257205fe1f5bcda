#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Trip statistics aggregate.
//!
//! A [`StatAggregate`] holds the counters for one `(category, period)`:
//! grand totals plus eight keyed counter tables ([`Table`]). Aggregates
//! merge by element-wise addition, so partial results from any number of
//! workers combine in any order to the same value.
//!
//! For storage every counter flattens to a short field name: a one-letter
//! table prefix followed by the key, e.g. `p10401` for pickups in district
//! 10401 or `h17` for pickups during hour 17.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator as _;
use strum_macros::{AsRefStr, Display, EnumIter};
use taxi_geo_models::{ALL_REGIONS, REGION_DIVISOR};
use taxi_trip_models::{Category, Period};

/// Trip duration bucket lower bounds, seconds.
pub const TRIP_TIME_BUCKETS: [u32; 7] = [0, 300, 600, 900, 1800, 2700, 3600];

/// Trip distance bucket lower bounds, miles.
pub const DISTANCE_BUCKETS: [u32; 6] = [0, 1, 2, 5, 10, 20];

/// Fare bucket lower bounds, dollars.
pub const FARE_BUCKETS: [u32; 6] = [0, 5, 10, 25, 50, 100];

/// Field name of the grand total counter.
pub const TOTAL_FIELD: &str = "l";

/// Field name of the invalid counter.
pub const INVALID_FIELD: &str = "i";

/// Highest bound `<= value`, or `0` when none match (including `NaN` and
/// negative values).
#[must_use]
pub fn bucket(value: f64, bounds: &[u32]) -> u32 {
    bounds
        .iter()
        .rev()
        .find(|b| value >= f64::from(**b))
        .copied()
        .unwrap_or(0)
}

/// Keyed counter tables of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    /// Pickups by district index.
    Pickups,
    /// Dropoffs by district index.
    Dropoffs,
    /// Pickups by hour of day.
    Hour,
    /// Trips by duration bucket.
    TripTime,
    /// Trips by distance bucket.
    Distance,
    /// Trips by fare bucket.
    Fare,
    /// Pickups by region, `0` = all.
    RegionPickups,
    /// Dropoffs by region, `0` = all.
    RegionDropoffs,
}

impl Table {
    /// One-letter storage prefix.
    #[must_use]
    pub const fn prefix(self) -> char {
        match self {
            Self::Pickups => 'p',
            Self::Dropoffs => 'r',
            Self::Hour => 'h',
            Self::TripTime => 't',
            Self::Distance => 's',
            Self::Fare => 'f',
            Self::RegionPickups => 'k',
            Self::RegionDropoffs => 'o',
        }
    }

    /// Inverse of [`Self::prefix`].
    #[must_use]
    pub fn from_prefix(prefix: char) -> Option<Self> {
        Self::iter().find(|t| t.prefix() == prefix)
    }
}

/// Counter table keyed by district index, hour, bucket bound, or region.
pub type Counters = BTreeMap<u32, u64>;

/// Counters for one category and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatAggregate {
    /// Dataset category.
    pub category: Category,
    /// Dataset month.
    pub period: Period,
    /// Records scanned.
    pub total: u64,
    /// Records whose pickup and dropoff were both unlocatable.
    pub invalid: u64,
    /// Pickups by district index.
    pub pickups: Counters,
    /// Dropoffs by district index.
    pub dropoffs: Counters,
    /// Pickups by hour of day.
    pub hour: Counters,
    /// Trips by duration bucket.
    pub trip_time: Counters,
    /// Trips by distance bucket.
    pub distance: Counters,
    /// Trips by fare bucket.
    pub fare: Counters,
    /// Pickups by region.
    pub region_pickups: Counters,
    /// Dropoffs by region.
    pub region_dropoffs: Counters,
}

impl StatAggregate {
    /// A zero-valued aggregate.
    #[must_use]
    pub const fn empty(category: Category, period: Period) -> Self {
        Self {
            category,
            period,
            total: 0,
            invalid: 0,
            pickups: BTreeMap::new(),
            dropoffs: BTreeMap::new(),
            hour: BTreeMap::new(),
            trip_time: BTreeMap::new(),
            distance: BTreeMap::new(),
            fare: BTreeMap::new(),
            region_pickups: BTreeMap::new(),
            region_dropoffs: BTreeMap::new(),
        }
    }

    /// Records that were located at least at one end.
    #[must_use]
    pub const fn valid(&self) -> u64 {
        self.total.saturating_sub(self.invalid)
    }

    /// Whether every counter is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.invalid == 0 && Table::iter().all(|t| self.table(t).is_empty())
    }

    /// Borrow one counter table.
    #[must_use]
    pub const fn table(&self, table: Table) -> &Counters {
        match table {
            Table::Pickups => &self.pickups,
            Table::Dropoffs => &self.dropoffs,
            Table::Hour => &self.hour,
            Table::TripTime => &self.trip_time,
            Table::Distance => &self.distance,
            Table::Fare => &self.fare,
            Table::RegionPickups => &self.region_pickups,
            Table::RegionDropoffs => &self.region_dropoffs,
        }
    }

    /// Mutably borrow one counter table.
    pub const fn table_mut(&mut self, table: Table) -> &mut Counters {
        match table {
            Table::Pickups => &mut self.pickups,
            Table::Dropoffs => &mut self.dropoffs,
            Table::Hour => &mut self.hour,
            Table::TripTime => &mut self.trip_time,
            Table::Distance => &mut self.distance,
            Table::Fare => &mut self.fare,
            Table::RegionPickups => &mut self.region_pickups,
            Table::RegionDropoffs => &mut self.region_dropoffs,
        }
    }

    /// Adds `count` to `key` in `table`.
    pub fn add(&mut self, table: Table, key: u32, count: u64) {
        *self.table_mut(table).entry(key).or_insert(0) += count;
    }

    /// Adds every counter of `other` into `self`.
    ///
    /// Category and period are not compared; callers merge aggregates of
    /// the same key.
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.invalid += other.invalid;
        for table in Table::iter() {
            for (&key, &count) in other.table(table) {
                self.add(table, key, count);
            }
        }
    }

    /// Consuming form of [`Self::merge`].
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    /// Recomputes the region tables from the district tables: each
    /// district counts towards `index / 10000`, and region `0` holds the
    /// grand sum.
    pub fn derive_region_totals(&mut self) {
        self.region_pickups = region_totals(&self.pickups);
        self.region_dropoffs = region_totals(&self.dropoffs);
    }

    /// Flattens every non-zero counter into `(field, value)` pairs.
    #[must_use]
    pub fn counters(&self) -> Vec<(String, u64)> {
        let mut fields = Vec::new();
        if self.total > 0 {
            fields.push((TOTAL_FIELD.to_string(), self.total));
        }
        if self.invalid > 0 {
            fields.push((INVALID_FIELD.to_string(), self.invalid));
        }
        for table in Table::iter() {
            for (&key, &count) in self.table(table) {
                if count > 0 {
                    fields.push((format!("{}{key}", table.prefix()), count));
                }
            }
        }
        fields
    }

    /// Rebuilds an aggregate from flattened counters. Unknown field names
    /// are skipped.
    pub fn from_counters<I, S>(category: Category, period: Period, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut aggregate = Self::empty(category, period);
        for (name, value) in fields {
            let name = name.as_ref();
            match name {
                TOTAL_FIELD => aggregate.total += value,
                INVALID_FIELD => aggregate.invalid += value,
                _ => {
                    let mut chars = name.chars();
                    let table = chars.next().and_then(Table::from_prefix);
                    let key = chars.as_str().parse::<u32>().ok();
                    if let (Some(table), Some(key)) = (table, key) {
                        aggregate.add(table, key, value);
                    }
                }
            }
        }
        aggregate
    }
}

fn region_totals(districts: &Counters) -> Counters {
    let mut totals = Counters::new();
    for (&index, &count) in districts {
        *totals.entry(index / REGION_DIVISOR).or_insert(0) += count;
        *totals.entry(ALL_REGIONS).or_insert(0) += count;
    }
    totals
}
