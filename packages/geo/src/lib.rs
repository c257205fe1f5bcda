#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Point-in-polygon district lookup for trip pickups and dropoffs.
//!
//! Loads NYC community district (or borough) polygons from `GeoJSON` and
//! answers "which district contains this point" with an ordered linear scan.
//! Districts are sorted so that the regions with the most trips are tested
//! first (Manhattan, then Queens, Brooklyn, the Bronx, Staten Island); the
//! order only affects how soon a scan exits, never the answer.

use std::path::Path;

use geo::{BoundingRect, Contains, MultiPolygon, Point, Rect};
use geojson::{GeoJson, JsonObject, JsonValue};
use taxi_geo_models::{BOROUGHS, District, REGION_DIVISOR};

/// Errors that can occur while loading district polygons.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    /// The polygon file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not valid `GeoJSON`.
    #[error("Invalid GeoJSON: {0}")]
    Parse(#[from] geojson::Error),

    /// The document is not a feature collection.
    #[error("Expected a GeoJSON FeatureCollection")]
    NotFeatureCollection,

    /// A feature lacks the properties that identify it.
    #[error("Feature {feature} has neither boro_cd nor boro_code")]
    MissingProperty {
        /// Zero-based feature position.
        feature: usize,
    },

    /// A feature geometry is missing or not polygonal.
    #[error("Feature {feature}: {message}")]
    Geometry {
        /// Zero-based feature position.
        feature: usize,
        /// Description of the problem.
        message: String,
    },
}

/// A district together with its polygon and bounding box.
struct DistrictEntry {
    district: District,
    bounds: Option<Rect<f64>>,
    polygon: MultiPolygon<f64>,
}

impl DistrictEntry {
    fn new(district: District, polygon: MultiPolygon<f64>) -> Self {
        Self {
            district,
            bounds: polygon.bounding_rect(),
            polygon,
        }
    }

    fn contains(&self, point: &Point<f64>) -> bool {
        let Some(bounds) = self.bounds else {
            return false;
        };
        let (min, max) = (bounds.min(), bounds.max());
        if point.x() < min.x || point.x() > max.x || point.y() < min.y || point.y() > max.y {
            return false;
        }
        self.polygon.contains(point)
    }
}

/// Scan priority of a region. Swaps the Bronx (2) and Queens (4).
const fn scan_priority(region: u32) -> u32 {
    match region {
        2 => 4,
        4 => 2,
        other => other,
    }
}

/// Ordered district polygons.
pub struct GeoIndex {
    entries: Vec<DistrictEntry>,
}

impl GeoIndex {
    /// Loads districts from a `GeoJSON` file.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::Io`] if the file can't be read, or any error from
    /// [`Self::from_geojson_str`].
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let text = std::fs::read_to_string(path).map_err(|e| GeoError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let index = Self::from_geojson_str(&text)?;
        log::info!("Loaded {} districts from {}", index.len(), path.display());
        Ok(index)
    }

    /// Parses a `GeoJSON` feature collection of community districts
    /// (`boro_cd` property) or boroughs (`boro_name` + `boro_code`).
    ///
    /// Each part of a community district multipolygon becomes its own
    /// district numbered `boro_cd * 100 + part` (parts count from 1). A
    /// borough stays whole with index `boro_code * 10000`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::Parse`] for invalid `GeoJSON`,
    /// [`GeoError::MissingProperty`] or [`GeoError::Geometry`] for features
    /// that can't be interpreted.
    pub fn from_geojson_str(text: &str) -> Result<Self, GeoError> {
        let GeoJson::FeatureCollection(collection) = text.parse::<GeoJson>()? else {
            return Err(GeoError::NotFeatureCollection);
        };

        let mut districts = Vec::new();
        for (i, feature) in collection.features.into_iter().enumerate() {
            let properties = feature.properties.unwrap_or_default();
            let Some(geometry) = feature.geometry else {
                return Err(GeoError::Geometry {
                    feature: i,
                    message: "missing geometry".to_string(),
                });
            };
            let geometry: geo::Geometry<f64> =
                geometry.try_into().map_err(|e: geojson::Error| GeoError::Geometry {
                    feature: i,
                    message: e.to_string(),
                })?;
            let polygon = match geometry {
                geo::Geometry::MultiPolygon(mp) => mp,
                geo::Geometry::Polygon(p) => MultiPolygon(vec![p]),
                _ => {
                    return Err(GeoError::Geometry {
                        feature: i,
                        message: "geometry is not a polygon".to_string(),
                    });
                }
            };

            if properties.contains_key("boro_name") {
                let code =
                    property_u32(&properties, "boro_code").ok_or(GeoError::MissingProperty { feature: i })?;
                let name = properties
                    .get("boro_name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                districts.push((
                    District {
                        index: code * REGION_DIVISOR,
                        name,
                    },
                    polygon,
                ));
            } else {
                let cd =
                    property_u32(&properties, "boro_cd").ok_or(GeoError::MissingProperty { feature: i })?;
                let name = format!("Community District {cd}");
                for (part, p) in (1u32..).zip(polygon.0) {
                    districts.push((
                        District {
                            index: cd * 100 + part,
                            name: name.clone(),
                        },
                        MultiPolygon(vec![p]),
                    ));
                }
            }
        }

        Ok(Self::from_districts(districts))
    }

    /// Builds an index from already-parsed districts, applying the scan
    /// order.
    #[must_use]
    pub fn from_districts(districts: Vec<(District, MultiPolygon<f64>)>) -> Self {
        let mut entries: Vec<DistrictEntry> = districts
            .into_iter()
            .map(|(district, polygon)| DistrictEntry::new(district, polygon))
            .collect();
        entries.sort_by_key(|e| scan_priority(e.district.region()));
        Self { entries }
    }

    /// Number of districts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no districts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Districts in scan order.
    pub fn districts(&self) -> impl Iterator<Item = &District> {
        self.entries.iter().map(|e| &e.district)
    }

    /// Finds the first district (in scan order) containing the point.
    #[must_use]
    pub fn locate(&self, longitude: f64, latitude: f64) -> Option<&District> {
        let point = Point::new(longitude, latitude);
        self.entries
            .iter()
            .find(|e| e.contains(&point))
            .map(|e| &e.district)
    }

    /// Locates a pickup and a dropoff in a single pass, stopping as soon as
    /// both are found.
    #[must_use]
    pub fn locate_trip(
        &self,
        pickup: (f64, f64),
        dropoff: (f64, f64),
    ) -> (Option<&District>, Option<&District>) {
        let pickup = Point::new(pickup.0, pickup.1);
        let dropoff = Point::new(dropoff.0, dropoff.1);
        let (mut found_pickup, mut found_dropoff) = (None, None);

        for entry in &self.entries {
            if found_pickup.is_none() && entry.contains(&pickup) {
                found_pickup = Some(&entry.district);
            }
            if found_dropoff.is_none() && entry.contains(&dropoff) {
                found_dropoff = Some(&entry.district);
            }
            if found_pickup.is_some() && found_dropoff.is_some() {
                break;
            }
        }

        (found_pickup, found_dropoff)
    }
}

/// Borough whose representative point is closest (planar distance).
///
/// Ties keep the lower borough code.
#[must_use]
pub fn nearest_borough_center(longitude: f64, latitude: f64) -> u32 {
    let mut best = BOROUGHS[0].code;
    let mut best_distance = f64::INFINITY;
    for borough in &BOROUGHS {
        let distance = (borough.longitude - longitude).hypot(borough.latitude - latitude);
        if distance < best_distance {
            best_distance = distance;
            best = borough.code;
        }
    }
    best
}

/// Reads an integer property that may be encoded as a number or a string.
fn property_u32(properties: &JsonObject, key: &str) -> Option<u32> {
    match properties.get(key)? {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISTRICTS: &str = include_str!("../fixtures/test_districts.geojson");

    fn index() -> GeoIndex {
        GeoIndex::from_geojson_str(DISTRICTS).unwrap()
    }

    #[test]
    fn flattens_parts_and_orders_by_scan_priority() {
        let order: Vec<u32> = index().districts().map(|d| d.index).collect();
        assert_eq!(order, vec![10_401, 10_501, 40_101, 40_102, 30_101, 20_101, 50_101]);
    }

    #[test]
    fn locates_point_inside_district() {
        let idx = index();
        let district = idx.locate(-74.0, 40.755).unwrap();
        assert_eq!(district.index, 10_401);
        assert_eq!(district.name, "Community District 104");
        assert_eq!(district.region(), 1);

        // Second part of a multipolygon district.
        assert_eq!(idx.locate(-73.78, 40.65).map(|d| d.index), Some(40_102));
    }

    #[test]
    fn point_outside_every_polygon_falls_back_to_borough_center() {
        let idx = index();
        assert!(idx.locate(-73.0, 41.5).is_none());
        let borough = nearest_borough_center(-73.0, 41.5);
        assert!((1..=5).contains(&borough));
    }

    #[test]
    fn nearest_center_picks_closest_borough() {
        assert_eq!(nearest_borough_center(-73.9655, 40.7829), 1);
        assert_eq!(nearest_borough_center(-73.88, 40.85), 2);
        assert_eq!(nearest_borough_center(-74.15, 40.60), 5);
    }

    #[test]
    fn locates_trip_endpoints_in_one_pass() {
        let idx = index();
        let (pickup, dropoff) = idx.locate_trip((-73.97, 40.75), (-73.97, 40.68));
        assert_eq!(pickup.map(|d| d.index), Some(10_501));
        assert_eq!(dropoff.map(|d| d.index), Some(30_101));

        let (pickup, dropoff) = idx.locate_trip((-73.0, 41.5), (-74.12, 40.59));
        assert!(pickup.is_none());
        assert_eq!(dropoff.map(|d| d.index), Some(50_101));
    }

    #[test]
    fn loads_whole_boroughs() {
        let text = r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "properties":{"boro_name":"Queens","boro_code":"4"},
            "geometry":{"type":"Polygon","coordinates":[[[-73.9,40.6],[-73.7,40.6],[-73.7,40.8],[-73.9,40.8],[-73.9,40.6]]]}}]}"#;
        let idx = GeoIndex::from_geojson_str(text).unwrap();
        let borough = idx.locate(-73.8, 40.7).unwrap();
        assert_eq!(borough.index, 40_000);
        assert_eq!(borough.name, "Queens");
    }

    #[test]
    fn rejects_feature_without_identity() {
        let text = r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "properties":{},
            "geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}}]}"#;
        assert!(matches!(
            GeoIndex::from_geojson_str(text),
            Err(GeoError::MissingProperty { feature: 0 })
        ));
        assert!(matches!(
            GeoIndex::from_geojson_str(r#"{"type":"Point","coordinates":[0,0]}"#),
            Err(GeoError::NotFeatureCollection)
        ));
    }

    #[test]
    fn loads_fixture_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/test_districts.geojson");
        assert_eq!(GeoIndex::load(&path).unwrap().len(), 7);
    }
}
