#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Trip dataset types shared across the taxi toolchain.
//!
//! Defines the two trip [`Category`] values, the monthly [`Period`] a
//! dataset file covers, the fixed-width record layout constants, and the
//! parsed [`TripRecord`] that scanners work with.
//!
//! Every normalized record is exactly [`RECORD_LENGTH`] bytes, so the byte
//! offset of record `i` in a normalized file is always `i * RECORD_LENGTH`.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Width in bytes of one normalized record, including the line terminator.
pub const RECORD_LENGTH: usize = 80;

/// Character used to right-pad a normalized record to [`RECORD_LENGTH`].
pub const PAD: u8 = b'*';

/// Separator between fields of a normalized record.
pub const FIELD_SEPARATOR: char = ',';

/// Unix timestamp of `2009-01-01T00:00:00Z`, the epoch all record time
/// offsets are measured from.
pub const BASE_EPOCH_SECONDS: i64 = 1_230_768_000;

/// Seconds per day.
const DAY_SECONDS: i64 = 86_400;

/// Errors produced while building or parsing trip types.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Period text or values could not be interpreted.
    #[error("Invalid period: {value}")]
    InvalidPeriod {
        /// The rejected input.
        value: String,
    },

    /// Period lies outside the published range for a category.
    #[error("date range must be from {min} to {max} for {category} data (got {period})")]
    OutOfRange {
        /// Dataset category.
        category: Category,
        /// The rejected period.
        period: Period,
        /// First available period.
        min: Period,
        /// Last available period.
        max: Period,
    },

    /// A fixed-width record could not be parsed.
    #[error("Malformed record: {message}")]
    MalformedRecord {
        /// Description of what went wrong.
        message: String,
    },
}

/// Trip dataset category. Determines schema epochs and file naming.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Category {
    /// Medallion (yellow) cabs, published from January 2009.
    Yellow,
    /// Boro (green) cabs, published from August 2013.
    Green,
}

impl Category {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Yellow, Self::Green]
    }

    /// First month for which trip data exists.
    #[must_use]
    pub const fn min_period(self) -> Period {
        match self {
            Self::Yellow => Period::from_parts(2009, 1),
            Self::Green => Period::from_parts(2013, 8),
        }
    }

    /// Last month covered by the coordinate-bearing schema.
    #[must_use]
    pub const fn max_period(self) -> Period {
        Period::from_parts(2016, 6)
    }

    /// Checks that `period` is within the published range for this
    /// category.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::OutOfRange`] if the period is before
    /// [`Self::min_period`] or after [`Self::max_period`].
    pub fn validate(self, period: Period) -> Result<(), ModelError> {
        let (min, max) = (self.min_period(), self.max_period());
        if period < min || period > max {
            return Err(ModelError::OutOfRange {
                category: self,
                period,
                min,
                max,
            });
        }
        Ok(())
    }
}

/// A calendar month (`year`, `month` 1-12) identifying one dataset file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    /// Four-digit year.
    pub year: i32,
    /// Month of year, 1-12.
    pub month: u32,
}

impl Period {
    /// Creates a period, validating the month.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidPeriod`] if `month` is not in 1-12.
    pub fn new(year: i32, month: u32) -> Result<Self, ModelError> {
        if !(1..=12).contains(&month) {
            return Err(ModelError::InvalidPeriod {
                value: format!("{year}-{month}"),
            });
        }
        Ok(Self { year, month })
    }

    const fn from_parts(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Storage key for this period: `year * 100 + month`.
    #[must_use]
    pub const fn date_key(self) -> i64 {
        self.year as i64 * 100 + self.month as i64
    }

    /// Inverse of [`Self::date_key`].
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidPeriod`] if the key does not encode a
    /// valid month.
    pub fn from_date_key(key: i64) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidPeriod {
            value: key.to_string(),
        };
        let year = i32::try_from(key / 100).map_err(|_| invalid())?;
        let month = u32::try_from(key % 100).map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }

    /// The month following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.month == 12 {
            Self::from_parts(self.year + 1, 1)
        } else {
            Self::from_parts(self.year, self.month + 1)
        }
    }

    /// Iterates every month from `self` through `end`, inclusive.
    ///
    /// Yields nothing when `end` is before `self`.
    pub fn through(self, end: Self) -> impl Iterator<Item = Self> {
        std::iter::successors(Some(self), |p| Some(p.next())).take_while(move |p| *p <= end)
    }

    /// First day of the month.
    #[must_use]
    pub fn first_day(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// English month name with year, e.g. `January 2016`.
    #[must_use]
    pub fn long_name(self) -> String {
        self.first_day().map_or_else(
            || self.to_string(),
            |d| format!("{} {}", month_name(d.month()), d.year()),
        )
    }
}

const fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ModelError;

    /// Parses `YYYY-MM` (a one-digit month is accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidPeriod {
            value: s.to_string(),
        };
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

/// Normalized dataset file name: `<category>-<YYYY>-<MM>.csv`.
#[must_use]
pub fn file_name(category: Category, period: Period) -> String {
    format!("{category}-{period}.csv")
}

/// Raw upstream file name: `<category>_tripdata_<YYYY>-<MM>.csv`.
#[must_use]
pub fn raw_file_name(category: Category, period: Period) -> String {
    format!("{category}_tripdata_{period}.csv")
}

/// A parsed normalized record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripRecord {
    /// Pickup time, seconds since [`BASE_EPOCH_SECONDS`].
    pub pickup_offset: i64,
    /// Dropoff time, seconds since [`BASE_EPOCH_SECONDS`].
    pub dropoff_offset: i64,
    /// Pickup longitude.
    pub pickup_longitude: f64,
    /// Pickup latitude.
    pub pickup_latitude: f64,
    /// Dropoff longitude.
    pub dropoff_longitude: f64,
    /// Dropoff latitude.
    pub dropoff_latitude: f64,
    /// Trip distance in miles.
    pub trip_distance: f64,
    /// Fare amount in dollars.
    pub fare_amount: f64,
}

impl TripRecord {
    /// Parses one fixed-width record (with or without its terminator).
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MalformedRecord`] if the record is not UTF-8,
    /// does not have exactly eight data fields plus padding, or a field
    /// fails to parse.
    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        let line = std::str::from_utf8(bytes).map_err(|e| ModelError::MalformedRecord {
            message: e.to_string(),
        })?;
        let fields: Vec<&str> = line.trim().split(FIELD_SEPARATOR).collect();

        // Eight data fields followed by the padding field.
        if fields.len() != 9 {
            return Err(ModelError::MalformedRecord {
                message: format!("expected 9 fields, found {}", fields.len()),
            });
        }

        Ok(Self {
            pickup_offset: parse_field(fields[0], "pickup time")?,
            dropoff_offset: parse_field(fields[1], "dropoff time")?,
            pickup_longitude: parse_field(fields[2], "pickup longitude")?,
            pickup_latitude: parse_field(fields[3], "pickup latitude")?,
            dropoff_longitude: parse_field(fields[4], "dropoff longitude")?,
            dropoff_latitude: parse_field(fields[5], "dropoff latitude")?,
            trip_distance: parse_field(fields[6], "trip distance")?,
            fare_amount: parse_field(fields[7], "fare amount")?,
        })
    }

    /// Trip duration in seconds (negative for inconsistent source rows).
    #[must_use]
    pub const fn trip_seconds(&self) -> i64 {
        self.dropoff_offset - self.pickup_offset
    }

    /// Hour of day (0-23) of the pickup.
    #[must_use]
    pub const fn pickup_hour(&self) -> u32 {
        // The base epoch is midnight UTC, so the hour is the offset within
        // the day.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let hour = (self.pickup_offset.rem_euclid(DAY_SECONDS) / 3600) as u32;
        hour
    }
}

fn parse_field<T: FromStr>(value: &str, name: &str) -> Result<T, ModelError> {
    value.parse::<T>().map_err(|_| ModelError::MalformedRecord {
        message: format!("{name}: {value:?}"),
    })
}
