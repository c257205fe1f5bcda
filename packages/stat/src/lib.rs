#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Trip statistics accumulation.
//!
//! Each scanning worker owns a [`StatAccumulator`], feeds it records, and
//! hands the finished [`StatAggregate`] to the reduce step.

pub mod report;

use taxi_geo::GeoIndex;
use taxi_stat_models::{DISTANCE_BUCKETS, FARE_BUCKETS, StatAggregate, TRIP_TIME_BUCKETS, Table, bucket};
use taxi_trip_models::{Category, Period, TripRecord};

pub use taxi_stat_models as models;

/// Mutable aggregate for one worker's scan.
#[derive(Debug, Clone)]
pub struct StatAccumulator {
    aggregate: StatAggregate,
}

impl StatAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new(category: Category, period: Period) -> Self {
        Self {
            aggregate: StatAggregate::empty(category, period),
        }
    }

    /// Classifies one record and updates the counters.
    ///
    /// Every record counts towards `total`. When neither end can be
    /// located the record only counts as `invalid`; otherwise the located
    /// districts and the hour, duration, distance and fare buckets are
    /// incremented.
    pub fn update(&mut self, record: &TripRecord, geo: &GeoIndex) {
        let agg = &mut self.aggregate;
        agg.total += 1;

        let (pickup, dropoff) = geo.locate_trip(
            (record.pickup_longitude, record.pickup_latitude),
            (record.dropoff_longitude, record.dropoff_latitude),
        );

        if pickup.is_none() && dropoff.is_none() {
            agg.invalid += 1;
            log::debug!(
                "unlocatable trip ({}, {}) -> ({}, {})",
                record.pickup_longitude,
                record.pickup_latitude,
                record.dropoff_longitude,
                record.dropoff_latitude
            );
            return;
        }

        if let Some(district) = pickup {
            agg.add(Table::Pickups, district.index, 1);
        }
        if let Some(district) = dropoff {
            agg.add(Table::Dropoffs, district.index, 1);
        }

        #[allow(clippy::cast_precision_loss)]
        let trip_seconds = record.trip_seconds() as f64;
        agg.add(Table::Hour, record.pickup_hour(), 1);
        agg.add(Table::TripTime, bucket(trip_seconds, &TRIP_TIME_BUCKETS), 1);
        agg.add(Table::Distance, bucket(record.trip_distance, &DISTANCE_BUCKETS), 1);
        agg.add(Table::Fare, bucket(record.fare_amount, &FARE_BUCKETS), 1);
    }

    /// Adds another accumulator's counters into this one.
    pub fn merge(&mut self, other: &Self) -> &mut Self {
        self.aggregate.merge(&other.aggregate);
        self
    }

    /// Counters collected so far (region tables not yet derived).
    #[must_use]
    pub const fn aggregate(&self) -> &StatAggregate {
        &self.aggregate
    }

    /// Derives region totals and returns the aggregate.
    #[must_use]
    pub fn finish(mut self) -> StatAggregate {
        self.aggregate.derive_region_totals();
        self.aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISTRICTS: &str = include_str!("../../geo/fixtures/test_districts.geojson");

    fn record(pickup: (f64, f64), dropoff: (f64, f64), secs: i64, distance: f64, fare: f64) -> TripRecord {
        // 2016-01-01 17:30 relative to 2009-01-01.
        let start = 220_838_400 + 17 * 3600 + 1800;
        TripRecord {
            pickup_offset: start,
            dropoff_offset: start + secs,
            pickup_longitude: pickup.0,
            pickup_latitude: pickup.1,
            dropoff_longitude: dropoff.0,
            dropoff_latitude: dropoff.1,
            trip_distance: distance,
            fare_amount: fare,
        }
    }

    fn accumulator() -> StatAccumulator {
        StatAccumulator::new(Category::Yellow, Period::new(2016, 1).unwrap())
    }

    #[test]
    fn buckets_located_trip() {
        let geo = GeoIndex::from_geojson_str(DISTRICTS).unwrap();
        let mut acc = accumulator();
        acc.update(&record((-74.0, 40.755), (-73.97, 40.68), 700, 3.2, 14.5), &geo);

        let agg = acc.finish();
        assert_eq!(agg.total, 1);
        assert_eq!(agg.invalid, 0);
        assert_eq!(agg.pickups.get(&10_401), Some(&1));
        assert_eq!(agg.dropoffs.get(&30_101), Some(&1));
        assert_eq!(agg.hour.get(&17), Some(&1));
        assert_eq!(agg.trip_time.get(&600), Some(&1));
        assert_eq!(agg.distance.get(&2), Some(&1));
        assert_eq!(agg.fare.get(&10), Some(&1));
        assert_eq!(agg.region_pickups.get(&1), Some(&1));
        assert_eq!(agg.region_dropoffs.get(&3), Some(&1));
        assert_eq!(agg.region_dropoffs.get(&0), Some(&1));
    }

    #[test]
    fn unlocatable_trip_counts_only_as_invalid() {
        let geo = GeoIndex::from_geojson_str(DISTRICTS).unwrap();
        let mut acc = accumulator();
        acc.update(&record((-70.0, 42.0), (-70.1, 42.1), 60, 1.0, 5.0), &geo);

        let agg = acc.finish();
        assert_eq!(agg.total, 1);
        assert_eq!(agg.invalid, 1);
        assert!(agg.pickups.is_empty());
        assert!(agg.hour.is_empty());
        assert!(agg.fare.is_empty());
    }

    #[test]
    fn one_located_end_is_valid() {
        let geo = GeoIndex::from_geojson_str(DISTRICTS).unwrap();
        let mut acc = accumulator();
        acc.update(&record((-70.0, 42.0), (-74.12, 40.59), 4000, 25.0, 120.0), &geo);

        let agg = acc.finish();
        assert_eq!(agg.invalid, 0);
        assert!(agg.pickups.is_empty());
        assert_eq!(agg.dropoffs.get(&50_101), Some(&1));
        assert_eq!(agg.trip_time.get(&3600), Some(&1));
        assert_eq!(agg.distance.get(&20), Some(&1));
        assert_eq!(agg.fare.get(&100), Some(&1));
    }

    #[test]
    fn merged_partials_equal_single_scan() {
        let geo = GeoIndex::from_geojson_str(DISTRICTS).unwrap();
        let trips = [
            record((-74.0, 40.755), (-73.97, 40.68), 100, 0.5, 4.0),
            record((-73.97, 40.75), (-73.88, 40.75), 1000, 6.0, 30.0),
            record((-70.0, 42.0), (-70.0, 42.0), 10, 0.1, 2.5),
            record((-73.78, 40.65), (-74.0, 40.76), 2000, 12.0, 60.0),
        ];

        let mut whole = accumulator();
        for t in &trips {
            whole.update(t, &geo);
        }

        let mut first = accumulator();
        let mut second = accumulator();
        for t in &trips[..2] {
            first.update(t, &geo);
        }
        for t in &trips[2..] {
            second.update(t, &geo);
        }
        second.merge(&first);

        assert_eq!(second.finish(), whole.finish());
    }
}
