//! Raw row to fixed-width record normalization.
//!
//! The upstream monthly CSVs changed column layout over time. A
//! [`RecordCodec`] is built for one `(category, period)` pair, picks the
//! matching [`SchemaEpoch`] once, and then turns each raw row into an
//! [`RECORD_LENGTH`]-byte line:
//!
//! ```text
//! <pickup secs>,<dropoff secs>,<plon>,<plat>,<dlon>,<dlat>,<dist>,<fare>,****\n
//! ```
//!
//! Times are seconds since 2009-01-01, coordinates carry 6 decimals,
//! distance and fare carry 2.

use std::fmt;

use chrono::NaiveDateTime;
use taxi_trip_models::{BASE_EPOCH_SECONDS, Category, FIELD_SEPARATOR, PAD, Period, RECORD_LENGTH};

/// Datetime formats seen in the raw files, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
];

/// Historical raw column layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaEpoch {
    /// Green trips before 2015: 22 columns including two trailing empties.
    GreenLegacy,
    /// Green trips January to June 2015: surcharge added, 23 columns.
    GreenSurcharge,
    /// Green trips from July 2015: trailing empties dropped, 21 columns.
    GreenCurrent,
    /// Yellow trips before 2015: 18 columns.
    YellowLegacy,
    /// Yellow trips from 2015: surcharge added, 19 columns.
    YellowCurrent,
}

impl SchemaEpoch {
    /// Selects the layout in effect for `category` in `period`.
    #[must_use]
    pub const fn select(category: Category, period: Period) -> Self {
        match category {
            Category::Green if period.year < 2015 => Self::GreenLegacy,
            Category::Green if period.year == 2015 && period.month < 7 => Self::GreenSurcharge,
            Category::Green => Self::GreenCurrent,
            Category::Yellow if period.year < 2015 => Self::YellowLegacy,
            Category::Yellow => Self::YellowCurrent,
        }
    }

    /// Column positions for this epoch.
    #[must_use]
    pub const fn layout(self) -> ColumnLayout {
        match self {
            Self::GreenLegacy => ColumnLayout::green(22),
            Self::GreenSurcharge => ColumnLayout::green(23),
            Self::GreenCurrent => ColumnLayout::green(21),
            Self::YellowLegacy => ColumnLayout::yellow(18),
            Self::YellowCurrent => ColumnLayout::yellow(19),
        }
    }
}

/// Zero-based positions of the fields a normalized record keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    /// Exact number of columns a row must have.
    pub columns: usize,
    pub pickup_time: usize,
    pub dropoff_time: usize,
    pub pickup_longitude: usize,
    pub pickup_latitude: usize,
    pub dropoff_longitude: usize,
    pub dropoff_latitude: usize,
    pub trip_distance: usize,
    pub fare_amount: usize,
}

impl ColumnLayout {
    const fn green(columns: usize) -> Self {
        Self {
            columns,
            pickup_time: 1,
            dropoff_time: 2,
            pickup_longitude: 5,
            pickup_latitude: 6,
            dropoff_longitude: 7,
            dropoff_latitude: 8,
            trip_distance: 10,
            fare_amount: 11,
        }
    }

    const fn yellow(columns: usize) -> Self {
        Self {
            columns,
            pickup_time: 1,
            dropoff_time: 2,
            trip_distance: 4,
            pickup_longitude: 5,
            pickup_latitude: 6,
            dropoff_longitude: 9,
            dropoff_latitude: 10,
            fare_amount: 12,
        }
    }
}

/// Why a raw row was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Row does not have the epoch's column count.
    ColumnCount {
        /// Columns the epoch requires.
        expected: usize,
        /// Columns found.
        found: usize,
    },
    /// A coordinate is zero, the upstream marker for "not recorded".
    MissingCoordinate,
    /// A required field did not parse.
    Unparseable {
        /// Field name.
        field: &'static str,
        /// Raw field text.
        value: String,
    },
    /// The joined fields leave no room for the terminator.
    TooLong {
        /// Length before padding.
        length: usize,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColumnCount { expected, found } => {
                write!(f, "expected {expected} columns, found {found}")
            }
            Self::MissingCoordinate => f.write_str("zero coordinate"),
            Self::Unparseable { field, value } => write!(f, "bad {field}: {value:?}"),
            Self::TooLong { length } => {
                write!(f, "record length {length} > {}, skip", RECORD_LENGTH - 1)
            }
        }
    }
}

/// Normalizes raw rows of one category and month.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    category: Category,
    period: Period,
    epoch: SchemaEpoch,
}

impl RecordCodec {
    /// Creates a codec using the layout in effect for `category` in
    /// `period`.
    #[must_use]
    pub const fn new(category: Category, period: Period) -> Self {
        Self {
            category,
            period,
            epoch: SchemaEpoch::select(category, period),
        }
    }

    /// The selected schema epoch.
    #[must_use]
    pub const fn epoch(&self) -> SchemaEpoch {
        self.epoch
    }

    /// Normalizes one raw row, logging a warning and returning `None` on
    /// rejection.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> Option<String> {
        match self.try_normalize(raw) {
            Ok(line) => Some(line),
            Err(reason) => {
                log::warn!("{}-{}: {reason}", self.category, self.period);
                None
            }
        }
    }

    /// Normalizes one raw row.
    ///
    /// On success the returned line is exactly [`RECORD_LENGTH`] bytes,
    /// newline included.
    ///
    /// # Errors
    ///
    /// Returns the [`RejectReason`] when the row is dropped.
    pub fn try_normalize(&self, raw: &str) -> Result<String, RejectReason> {
        let layout = self.epoch.layout();
        let columns: Vec<&str> = raw.trim().split(FIELD_SEPARATOR).collect();
        if columns.len() != layout.columns {
            return Err(RejectReason::ColumnCount {
                expected: layout.columns,
                found: columns.len(),
            });
        }

        let coordinates = [
            columns[layout.pickup_longitude],
            columns[layout.pickup_latitude],
            columns[layout.dropoff_longitude],
            columns[layout.dropoff_latitude],
        ];
        if coordinates.iter().any(|c| c.trim() == "0") {
            return Err(RejectReason::MissingCoordinate);
        }

        let pickup = parse_offset(columns[layout.pickup_time], "pickup time")?;
        let dropoff = parse_offset(columns[layout.dropoff_time], "dropoff time")?;
        let pickup_longitude = parse_number(coordinates[0], "pickup longitude")?;
        let pickup_latitude = parse_number(coordinates[1], "pickup latitude")?;
        let dropoff_longitude = parse_number(coordinates[2], "dropoff longitude")?;
        let dropoff_latitude = parse_number(coordinates[3], "dropoff latitude")?;
        let trip_distance = parse_number(columns[layout.trip_distance], "trip distance")?;
        let fare_amount = parse_number(columns[layout.fare_amount], "fare amount")?;

        #[allow(clippy::float_cmp)]
        let zero = [
            pickup_longitude,
            pickup_latitude,
            dropoff_longitude,
            dropoff_latitude,
        ]
        .iter()
        .any(|v| *v == 0.0);
        if zero {
            return Err(RejectReason::MissingCoordinate);
        }

        let mut line = format!(
            "{pickup},{dropoff},{pickup_longitude:.6},{pickup_latitude:.6},\
             {dropoff_longitude:.6},{dropoff_latitude:.6},{trip_distance:.2},{fare_amount:.2},"
        );

        let width = RECORD_LENGTH - 1;
        if line.len() > width {
            return Err(RejectReason::TooLong { length: line.len() });
        }

        line.extend(std::iter::repeat_n(char::from(PAD), width - line.len()));
        line.push('\n');
        Ok(line)
    }
}

/// Parses a raw datetime into seconds since the record epoch.
fn parse_offset(value: &str, field: &'static str) -> Result<i64, RejectReason> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.and_utc().timestamp() - BASE_EPOCH_SECONDS)
        .ok_or_else(|| RejectReason::Unparseable {
            field,
            value: value.to_string(),
        })
}

fn parse_number(value: &str, field: &'static str) -> Result<f64, RejectReason> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RejectReason::Unparseable {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREEN_2016: &str = "2,2016-01-01 00:29:24,2016-01-01 00:39:36,N,1,\
        -73.928642272949219,40.680610656738281,-73.924278259277344,40.698043823242188,\
        1,1.46,8,0.5,0.5,1.86,0,,0.3,11.16,1,1";

    fn codec(category: Category, year: i32, month: u32) -> RecordCodec {
        RecordCodec::new(category, Period::new(year, month).unwrap())
    }

    #[test]
    fn selects_schema_epoch() {
        assert_eq!(codec(Category::Green, 2014, 12).epoch(), SchemaEpoch::GreenLegacy);
        assert_eq!(codec(Category::Green, 2015, 6).epoch(), SchemaEpoch::GreenSurcharge);
        assert_eq!(codec(Category::Green, 2015, 7).epoch(), SchemaEpoch::GreenCurrent);
        assert_eq!(codec(Category::Yellow, 2014, 1).epoch(), SchemaEpoch::YellowLegacy);
        assert_eq!(codec(Category::Yellow, 2016, 6).epoch(), SchemaEpoch::YellowCurrent);
    }

    #[test]
    fn normalizes_green_row_to_fixed_width() {
        let line = codec(Category::Green, 2016, 1).try_normalize(GREEN_2016).unwrap();
        assert_eq!(line.len(), RECORD_LENGTH);
        assert_eq!(
            line,
            "220840164,220840776,-73.928642,40.680611,-73.924278,40.698044,1.46,8.00,*******\n"
        );
    }

    #[test]
    fn normalizes_yellow_rows_in_both_epochs() {
        let current = "2,2015-01-15 19:05:39,2015-01-15 19:23:42,1,1.59,-73.993896484375,\
            40.750110626220703,1,N,-73.974784851074219,40.750617980957031,1,12,1,0.5,3.25,0,0.3,17.05";
        let line = codec(Category::Yellow, 2015, 1).try_normalize(current).unwrap();
        assert_eq!(line.len(), RECORD_LENGTH);
        assert!(line.starts_with("190580739,190581822,-73.993896,40.750111,-73.974785,40.750618,1.59,12.00,"));

        let legacy = "CMT,2014-01-09 20:45:25,2014-01-09 20:52:31,1,0.7,-73.994770,40.736828,\
            1,N,-73.982227,40.731790,CRD,6.5,0.5,0.5,1.4,0,8.9";
        let line = codec(Category::Yellow, 2014, 1).try_normalize(legacy).unwrap();
        assert_eq!(line.len(), RECORD_LENGTH);
        assert!(line.contains(",0.70,6.50,"));
    }

    #[test]
    fn normalizes_legacy_green_row_with_trailing_empties() {
        let row = "2,2014-01-01 00:00:00,2014-01-01 00:10:00,N,1,-73.95,40.71,-73.96,40.72,\
            1,2.00,9.5,0.5,0.5,0,0,,10.5,2,1,,";
        let line = codec(Category::Green, 2014, 1).try_normalize(row).unwrap();
        assert!(line.starts_with("157766400,157767000,-73.950000,40.710000,"));
        assert!(line.ends_with("*\n"));
    }

    #[test]
    fn rejects_zero_coordinates() {
        let row = GREEN_2016.replace("-73.928642272949219", "0");
        assert_eq!(
            codec(Category::Green, 2016, 1).try_normalize(&row),
            Err(RejectReason::MissingCoordinate)
        );
        let row = GREEN_2016.replace("40.698043823242188", "0.0");
        assert_eq!(
            codec(Category::Green, 2016, 1).try_normalize(&row),
            Err(RejectReason::MissingCoordinate)
        );
        assert!(codec(Category::Green, 2016, 1).normalize(&row).is_none());
    }

    #[test]
    fn rejects_wrong_column_count() {
        // A 2016 row under the 2014 layout.
        assert_eq!(
            codec(Category::Green, 2014, 1).try_normalize(GREEN_2016),
            Err(RejectReason::ColumnCount {
                expected: 22,
                found: 21
            })
        );
    }

    #[test]
    fn rejects_unparseable_fields() {
        let row = GREEN_2016.replace("1.46", "n/a");
        assert!(matches!(
            codec(Category::Green, 2016, 1).try_normalize(&row),
            Err(RejectReason::Unparseable {
                field: "trip distance",
                ..
            })
        ));
        let row = GREEN_2016.replace("2016-01-01 00:29:24", "yesterday");
        assert!(matches!(
            codec(Category::Green, 2016, 1).try_normalize(&row),
            Err(RejectReason::Unparseable {
                field: "pickup time",
                ..
            })
        ));
    }

    #[test]
    fn rejects_overlong_records() {
        let row = GREEN_2016.replace(",8,0.5,", ",123456789012345678,0.5,");
        assert!(matches!(
            codec(Category::Green, 2016, 1).try_normalize(&row),
            Err(RejectReason::TooLong { .. })
        ));
    }
}
