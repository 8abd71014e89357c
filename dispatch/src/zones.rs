//! Geofence zone evaluation.
//!
//! Classifies a coordinate against the configured zones. When zones overlap
//! the highest risk tier wins, then the smallest area (most specific match),
//! then the lowest zone id, so the result never depends on configuration
//! order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::{Coordinate, RiskTier, Zone, ZoneShape, EARTH_RADIUS_M};

/// Zone configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ZoneError {
    #[error("Zone {0}: polygon needs at least three vertices")]
    DegeneratePolygon(String),

    #[error("Zone {0}: circle radius must be positive")]
    InvalidRadius(String),

    #[error("Zone {0}: coordinate out of range")]
    InvalidCoordinate(String),

    #[error("Duplicate zone id: {0}")]
    DuplicateId(String),
}

/// Result of classifying a coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneMatch {
    /// `safe` when no zone matched
    pub risk_tier: RiskTier,
    pub zone: Option<Zone>,
}

impl ZoneMatch {
    pub fn unclassified() -> Self {
        Self {
            risk_tier: RiskTier::Safe,
            zone: None,
        }
    }
}

/// A validated zone with its precomputed area.
#[derive(Debug, Clone)]
struct IndexedZone {
    zone: Zone,
    area_m2: f64,
}

/// Pure evaluator over a fixed zone set.
#[derive(Debug, Clone, Default)]
pub struct ZoneEvaluator {
    zones: Vec<IndexedZone>,
}

impl ZoneEvaluator {
    /// Validate zones and build the evaluator.
    pub fn new(zones: Vec<Zone>) -> Result<Self, ZoneError> {
        let mut seen = HashSet::new();
        let mut indexed = Vec::with_capacity(zones.len());

        for zone in zones {
            if !seen.insert(zone.id.clone()) {
                return Err(ZoneError::DuplicateId(zone.id));
            }
            validate(&zone)?;
            let area_m2 = area_m2(&zone.shape);
            indexed.push(IndexedZone { zone, area_m2 });
        }

        Ok(Self { zones: indexed })
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.zones.iter().map(|z| z.zone.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Classify a coordinate.
    pub fn evaluate(&self, point: &Coordinate) -> ZoneMatch {
        let best = self
            .zones
            .iter()
            .filter(|z| contains(&z.zone.shape, point))
            .min_by(|a, b| precedence(a, b));

        match best {
            Some(z) => ZoneMatch {
                risk_tier: z.zone.risk_tier,
                zone: Some(z.zone.clone()),
            },
            None => ZoneMatch::unclassified(),
        }
    }
}

/// `Less` means `a` wins.
fn precedence(a: &IndexedZone, b: &IndexedZone) -> Ordering {
    b.zone
        .risk_tier
        .cmp(&a.zone.risk_tier)
        .then_with(|| a.area_m2.total_cmp(&b.area_m2))
        .then_with(|| a.zone.id.cmp(&b.zone.id))
}

fn validate(zone: &Zone) -> Result<(), ZoneError> {
    match &zone.shape {
        ZoneShape::Circle { center, radius_m } => {
            if !center.is_valid() {
                return Err(ZoneError::InvalidCoordinate(zone.id.clone()));
            }
            if !(radius_m.is_finite() && *radius_m > 0.0) {
                return Err(ZoneError::InvalidRadius(zone.id.clone()));
            }
        }
        ZoneShape::Polygon { vertices } => {
            if vertices.len() < 3 {
                return Err(ZoneError::DegeneratePolygon(zone.id.clone()));
            }
            if vertices.iter().any(|v| !v.is_valid()) {
                return Err(ZoneError::InvalidCoordinate(zone.id.clone()));
            }
        }
    }
    Ok(())
}

/// Whether `point` lies within `shape`.
pub fn contains(shape: &ZoneShape, point: &Coordinate) -> bool {
    match shape {
        ZoneShape::Circle { center, radius_m } => center.distance_m(point) <= *radius_m,
        ZoneShape::Polygon { vertices } => polygon_contains(vertices, point),
    }
}

/// Even-odd ray casting in lon/lat space.
fn polygon_contains(vertices: &[Coordinate], point: &Coordinate) -> bool {
    let (x, y) = (point.lon, point.lat);
    let mut inside = false;
    let mut j = vertices.len() - 1;

    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i].lon, vertices[i].lat);
        let (xj, yj) = (vertices[j].lon, vertices[j].lat);

        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}

/// Surface area in square metres.
pub fn area_m2(shape: &ZoneShape) -> f64 {
    match shape {
        ZoneShape::Circle { radius_m, .. } => std::f64::consts::PI * radius_m * radius_m,
        ZoneShape::Polygon { vertices } => {
            // Equirectangular projection around the mean latitude
            let mean_lat =
                vertices.iter().map(|v| v.lat).sum::<f64>() / vertices.len() as f64;
            let kx = EARTH_RADIUS_M * mean_lat.to_radians().cos();
            let project = |c: &Coordinate| (c.lon.to_radians() * kx, c.lat.to_radians() * EARTH_RADIUS_M);

            let mut twice_area = 0.0;
            for i in 0..vertices.len() {
                let (x1, y1) = project(&vertices[i]);
                let (x2, y2) = project(&vertices[(i + 1) % vertices.len()]);
                twice_area += x1 * y2 - x2 * y1;
            }
            twice_area.abs() / 2.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(id: &str, tier: RiskTier, lat: f64, lon: f64, half: f64) -> Zone {
        Zone {
            id: id.to_string(),
            name: id.to_string(),
            shape: ZoneShape::Polygon {
                vertices: vec![
                    Coordinate::new(lat - half, lon - half),
                    Coordinate::new(lat - half, lon + half),
                    Coordinate::new(lat + half, lon + half),
                    Coordinate::new(lat + half, lon - half),
                ],
            },
            risk_tier: tier,
            recommendations: vec![],
            emergency_contacts: vec![],
        }
    }

    fn circle(id: &str, tier: RiskTier, lat: f64, lon: f64, radius_m: f64) -> Zone {
        Zone {
            id: id.to_string(),
            name: id.to_string(),
            shape: ZoneShape::Circle {
                center: Coordinate::new(lat, lon),
                radius_m,
            },
            risk_tier: tier,
            recommendations: vec!["Stay with your group".to_string()],
            emergency_contacts: vec![],
        }
    }

    #[test]
    fn test_no_zone_is_unclassified() {
        let evaluator = ZoneEvaluator::new(vec![circle("c", RiskTier::Danger, 10.0, 10.0, 100.0)])
            .unwrap();
        let result = evaluator.evaluate(&Coordinate::new(0.0, 0.0));
        assert_eq!(result, ZoneMatch::unclassified());
    }

    #[test]
    fn test_highest_tier_wins() {
        let evaluator = ZoneEvaluator::new(vec![
            square("city", RiskTier::Caution, 40.0, -74.0, 0.5),
            circle("river", RiskTier::Danger, 40.0, -74.0, 5_000.0),
            square("park", RiskTier::Safe, 40.0, -74.0, 0.01),
        ])
        .unwrap();

        let result = evaluator.evaluate(&Coordinate::new(40.0, -74.0));
        assert_eq!(result.risk_tier, RiskTier::Danger);
        assert_eq!(result.zone.unwrap().id, "river");
    }

    #[test]
    fn test_smallest_area_breaks_ties() {
        let evaluator = ZoneEvaluator::new(vec![
            square("district", RiskTier::Caution, 40.0, -74.0, 0.5),
            square("block", RiskTier::Caution, 40.0, -74.0, 0.01),
        ])
        .unwrap();

        let result = evaluator.evaluate(&Coordinate::new(40.0, -74.0));
        assert_eq!(result.zone.unwrap().id, "block");
    }

    #[test]
    fn test_independent_of_order() {
        let zones = vec![
            circle("a", RiskTier::Caution, 0.0, 0.0, 1_000.0),
            circle("b", RiskTier::Caution, 0.0, 0.0, 1_000.0),
            square("c", RiskTier::Caution, 0.0, 0.0, 0.5),
        ];
        let mut reversed = zones.clone();
        reversed.reverse();

        let point = Coordinate::new(0.0, 0.0);
        let forward = ZoneEvaluator::new(zones).unwrap().evaluate(&point);
        let backward = ZoneEvaluator::new(reversed).unwrap().evaluate(&point);
        assert_eq!(forward, backward);
        // Equal circles: lowest id
        assert_eq!(forward.zone.unwrap().id, "a");
    }

    #[test]
    fn test_polygon_containment() {
        let zone = square("sq", RiskTier::Danger, 10.0, 10.0, 1.0);
        assert!(contains(&zone.shape, &Coordinate::new(10.5, 10.5)));
        assert!(!contains(&zone.shape, &Coordinate::new(11.5, 10.5)));

        // Concave "L" shape: the notch is outside
        let l_shape = ZoneShape::Polygon {
            vertices: vec![
                Coordinate::new(0.0, 0.0),
                Coordinate::new(0.0, 2.0),
                Coordinate::new(1.0, 2.0),
                Coordinate::new(1.0, 1.0),
                Coordinate::new(2.0, 1.0),
                Coordinate::new(2.0, 0.0),
            ],
        };
        assert!(contains(&l_shape, &Coordinate::new(0.5, 1.5)));
        assert!(!contains(&l_shape, &Coordinate::new(1.5, 1.5)));
    }

    #[test]
    fn test_area_is_in_square_metres() {
        // ~1.11 km square at the equator
        let zone = square("sq", RiskTier::Safe, 0.0, 0.0, 0.005);
        let area = area_m2(&zone.shape);
        assert!((area - 1.236e6).abs() < 2e4, "area was {}", area);
    }

    #[test]
    fn test_rejects_bad_zones() {
        let mut bad = square("p", RiskTier::Safe, 0.0, 0.0, 1.0);
        bad.shape = ZoneShape::Polygon {
            vertices: vec![Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0)],
        };
        assert_eq!(
            ZoneEvaluator::new(vec![bad]).unwrap_err(),
            ZoneError::DegeneratePolygon("p".into())
        );

        assert_eq!(
            ZoneEvaluator::new(vec![circle("c", RiskTier::Safe, 0.0, 0.0, 0.0)]).unwrap_err(),
            ZoneError::InvalidRadius("c".into())
        );

        assert_eq!(
            ZoneEvaluator::new(vec![
                circle("dup", RiskTier::Safe, 0.0, 0.0, 10.0),
                circle("dup", RiskTier::Danger, 1.0, 1.0, 10.0),
            ])
            .unwrap_err(),
            ZoneError::DuplicateId("dup".into())
        );
    }
}
