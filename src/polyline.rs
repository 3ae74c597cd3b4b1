//! Flattened route geometry.
//!
//! A commute route arrives as a list of segments; overlap detection wants a
//! single point sequence with cumulative distance along it. Junction points
//! shared by consecutive segments are collapsed.

use serde::{Deserialize, Serialize};

use crate::haversine::{interpolate, planar_distance_m};
use crate::model::{GeoPoint, RouteSegment};

/// Points closer than this are treated as the same point when flattening.
const DUPLICATE_POINT_M: f64 = 1.0;

/// A route as decoded coordinates plus cumulative distance in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<GeoPoint>,
    cumulative_m: Vec<f64>,
}

impl Polyline {
    pub fn new(points: Vec<GeoPoint>) -> Self {
        let mut cumulative_m = Vec::with_capacity(points.len());
        let mut total = 0.0;
        for (index, point) in points.iter().enumerate() {
            if index > 0 {
                total += planar_distance_m(points[index - 1], *point);
            }
            cumulative_m.push(total);
        }
        Self {
            points,
            cumulative_m,
        }
    }

    /// Concatenate route segments, dropping duplicated junction points.
    pub fn from_segments(segments: &[RouteSegment]) -> Self {
        let mut points: Vec<GeoPoint> = Vec::new();
        for point in segments.iter().flat_map(|segment| segment.points.iter()) {
            if let Some(last) = points.last() {
                if planar_distance_m(*last, *point) < DUPLICATE_POINT_M {
                    continue;
                }
            }
            points.push(*point);
        }
        Self::new(points)
    }

    /// Resample so no two consecutive points are more than `max_spacing_m`
    /// apart. Original vertices are kept.
    pub fn densify(&self, max_spacing_m: f64) -> Self {
        if self.points.len() < 2 || max_spacing_m <= 0.0 {
            return self.clone();
        }

        let mut points = Vec::with_capacity(self.points.len());
        points.push(self.points[0]);
        for pair in self.points.windows(2) {
            let gap = planar_distance_m(pair[0], pair[1]);
            let steps = (gap / max_spacing_m).ceil().max(1.0) as usize;
            for step in 1..steps {
                points.push(interpolate(pair[0], pair[1], step as f64 / steps as f64));
            }
            points.push(pair[1]);
        }
        Self::new(points)
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn cumulative_m(&self) -> &[f64] {
        &self.cumulative_m
    }

    pub fn length_m(&self) -> f64 {
        self.cumulative_m.last().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<GeoPoint> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<GeoPoint> {
        self.points.last().copied()
    }

    pub fn into_points(self) -> Vec<GeoPoint> {
        self.points
    }
}
