#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geographic lookup types for New York City trip aggregation.
//!
//! A [`District`] index encodes its parent region (borough):
//! `index / 10000` is the borough code 1-5. Community district parts are
//! numbered `boro_cd * 100 + part`, whole boroughs `boro_code * 10000`.

use serde::{Deserialize, Serialize};

/// Divisor that recovers the region from a district index.
pub const REGION_DIVISOR: u32 = 10_000;

/// Region code used for city-wide totals.
pub const ALL_REGIONS: u32 = 0;

/// A named polygon bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct District {
    /// `region * 10000 + ordinal`, or `region * 10000` for a whole borough.
    pub index: u32,
    /// Display name.
    pub name: String,
}

impl District {
    /// Parent region (borough code).
    #[must_use]
    pub const fn region(&self) -> u32 {
        self.index / REGION_DIVISOR
    }
}

impl std::fmt::Display for District {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.index, self.name)
    }
}

/// A borough with its fixed representative point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Borough {
    /// Borough code, 1-5.
    pub code: u32,
    /// Display name.
    pub name: &'static str,
    /// Representative longitude.
    pub longitude: f64,
    /// Representative latitude.
    pub latitude: f64,
}

/// The five boroughs, in code order.
pub const BOROUGHS: [Borough; 5] = [
    // Central Park
    Borough {
        code: 1,
        name: "Manhattan",
        longitude: -73.965_527,
        latitude: 40.782_966,
    },
    // Bronx Zoo
    Borough {
        code: 2,
        name: "Bronx",
        longitude: -73.877_636,
        latitude: 40.851_236,
    },
    // Brooklyn College
    Borough {
        code: 3,
        name: "Brooklyn",
        longitude: -73.951_279,
        latitude: 40.631_111,
    },
    // St. John's University
    Borough {
        code: 4,
        name: "Queens",
        longitude: -73.796_699,
        latitude: 40.725_518,
    },
    // College of Staten Island
    Borough {
        code: 5,
        name: "Staten Island",
        longitude: -74.148_280,
        latitude: 40.605_389,
    },
];

/// Display name of a region code; `0` is the city-wide total.
#[must_use]
pub fn region_name(region: u32) -> &'static str {
    if region == ALL_REGIONS {
        return "All Boroughs";
    }
    BOROUGHS
        .iter()
        .find(|b| b.code == region)
        .map_or("Unknown", |b| b.name)
}

/// Region codes in report order: city-wide first, then boroughs 1-5.
#[must_use]
pub fn report_regions() -> impl Iterator<Item = u32> {
    std::iter::once(ALL_REGIONS).chain(BOROUGHS.iter().map(|b| b.code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn district_region_comes_from_index() {
        let d = District {
            index: 40_102,
            name: "Community District 401".to_string(),
        };
        assert_eq!(d.region(), 4);
        assert_eq!(d.to_string(), "40102: Community District 401");
    }

    #[test]
    fn names_regions() {
        assert_eq!(region_name(0), "All Boroughs");
        assert_eq!(region_name(3), "Brooklyn");
        assert_eq!(region_name(9), "Unknown");
        assert_eq!(report_regions().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    }
}
