//! Shared-route detection between two commutes.
//!
//! Both routes are resampled, then every pair of sampled points is tested
//! for coincidence. A run is a chain of coincident index pairs where each
//! step advances one or both indices by one, so the two commuters move
//! forward together. The longest run (measured as the mean distance it
//! covers along each route) defines the overlap.

use crate::config::OverlapOptions;
use crate::haversine::planar_distance_m;
use crate::model::{CommuteIntent, GeoPoint, SharedSegment, Waypoint};
use crate::polyline::Polyline;

/// Float slack when comparing run lengths for tie-breaking.
const EPSILON: f64 = 1e-9;

/// A route ready for pairwise comparison.
#[derive(Debug, Clone)]
pub struct PreparedRoute {
    pub polyline: Polyline,
    /// Named locations used to label meet and split points.
    pub landmarks: Vec<Waypoint>,
    bounds: Bounds,
}

impl PreparedRoute {
    pub fn new(polyline: Polyline, landmarks: Vec<Waypoint>, options: &OverlapOptions) -> Self {
        let polyline = polyline.densify(options.sample_spacing_m);
        let bounds = Bounds::of(polyline.points());
        Self {
            polyline,
            landmarks,
            bounds,
        }
    }

    pub fn from_intent(intent: &CommuteIntent, options: &OverlapOptions) -> Self {
        Self::new(
            Polyline::from_segments(&intent.route),
            vec![intent.start.clone(), intent.end.clone()],
            options,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: GeoPoint,
    max: GeoPoint,
}

impl Bounds {
    fn of(points: &[GeoPoint]) -> Self {
        let mut min = GeoPoint::new(f64::INFINITY, f64::INFINITY);
        let mut max = GeoPoint::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for point in points {
            min.lat = min.lat.min(point.lat);
            min.lng = min.lng.min(point.lng);
            max.lat = max.lat.max(point.lat);
            max.lng = max.lng.max(point.lng);
        }
        Self { min, max }
    }

    /// Conservative test: could any point of `self` lie within `margin_m`
    /// of any point of `other`?
    fn near(&self, other: &Bounds, margin_m: f64) -> bool {
        // One degree of latitude is ~111 km; longitude degrees are never
        // longer than that, so this margin over-approximates.
        let margin_deg = margin_m / 111_000.0;
        let lat_scale = self.min.lat.abs().max(self.max.lat.abs()).to_radians().cos().max(0.01);
        let lng_margin = margin_deg / lat_scale;
        self.min.lat - margin_deg <= other.max.lat
            && other.min.lat - margin_deg <= self.max.lat
            && self.min.lng - lng_margin <= other.max.lng
            && other.min.lng - lng_margin <= self.max.lng
    }
}

/// Result of comparing two routes.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOverlap {
    /// Shared distance over the longer route's length, in [0, 1].
    pub score: f64,
    pub shared: Option<SharedSegment>,
}

impl RouteOverlap {
    pub fn none() -> Self {
        Self {
            score: 0.0,
            shared: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunStart {
    /// cumulative_a[i] + cumulative_b[j] at the run's first cell.
    cost: f64,
    i: usize,
    j: usize,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    start: RunStart,
    end_i: usize,
    length_m: f64,
    /// Distance of the run's midpoint from both routes' midpoints, as
    /// fractions of route length. Lower is more central.
    off_center: f64,
}

/// Compare two prepared routes.
pub fn route_overlap(a: &PreparedRoute, b: &PreparedRoute, options: &OverlapOptions) -> RouteOverlap {
    let points_a = a.polyline.points();
    let points_b = b.polyline.points();
    if points_a.is_empty() || points_b.is_empty() {
        return RouteOverlap::none();
    }
    if !a.bounds.near(&b.bounds, options.coincidence_threshold_m) {
        return RouteOverlap::none();
    }

    let Some(run) = longest_run(&a.polyline, &b.polyline, options.coincidence_threshold_m) else {
        return RouteOverlap::none();
    };

    let longest = a.polyline.length_m().max(b.polyline.length_m());
    if longest <= 0.0 {
        return RouteOverlap::none();
    }
    let score = (run.length_m / longest).clamp(0.0, 1.0);

    let meet_point = points_a[run.start.i];
    let split_point = points_a[run.end_i];
    let landmarks: Vec<&Waypoint> = a.landmarks.iter().chain(b.landmarks.iter()).collect();

    RouteOverlap {
        score,
        shared: Some(SharedSegment {
            meet_point,
            split_point,
            meet_name: nearest_name(meet_point, &landmarks),
            split_name: nearest_name(split_point, &landmarks),
            shared_distance_m: run.length_m,
        }),
    }
}

fn longest_run(a: &Polyline, b: &Polyline, threshold_m: f64) -> Option<Run> {
    let points_a = a.points();
    let points_b = b.points();
    let cum_a = a.cumulative_m();
    let cum_b = b.cumulative_m();
    let len_a = a.length_m();
    let len_b = b.length_m();

    let mut prev: Vec<Option<RunStart>> = vec![None; points_b.len()];
    let mut cur: Vec<Option<RunStart>> = vec![None; points_b.len()];
    let mut best: Option<Run> = None;
    let mut max_length_m = 0.0_f64;

    for i in 0..points_a.len() {
        for j in 0..points_b.len() {
            if planar_distance_m(points_a[i], points_b[j]) >= threshold_m {
                cur[j] = None;
                continue;
            }

            let own = cum_a[i] + cum_b[j];
            let mut start = RunStart { cost: own, i, j };
            let diagonal = if i > 0 && j > 0 { prev[j - 1] } else { None };
            let up = if i > 0 { prev[j] } else { None };
            let left = if j > 0 { cur[j - 1] } else { None };
            for candidate in [diagonal, up, left].into_iter().flatten() {
                if candidate.cost < start.cost {
                    start = candidate;
                }
            }
            cur[j] = Some(start);

            let length_m = (own - start.cost) / 2.0;
            if length_m <= EPSILON {
                continue;
            }
            max_length_m = max_length_m.max(length_m);

            let off_center = centre_offset(cum_a[start.i], cum_a[i], len_a)
                + centre_offset(cum_b[start.j], cum_b[j], len_b);
            let run = Run {
                start,
                end_i: i,
                length_m,
                off_center,
            };

            best = match best {
                None => Some(run),
                Some(current) if run.length_m > current.length_m + EPSILON => Some(run),
                Some(current)
                    if (run.length_m - current.length_m).abs() <= EPSILON
                        && run.off_center < current.off_center - EPSILON =>
                {
                    Some(run)
                }
                keep => keep,
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    // The score must not depend on which run won a near-tie, so report the
    // exact maximum rather than the tie-broken run's own length.
    best.map(|run| Run {
        length_m: max_length_m,
        ..run
    })
}

fn centre_offset(from_m: f64, to_m: f64, length_m: f64) -> f64 {
    if length_m <= 0.0 {
        return 0.0;
    }
    ((from_m + to_m) / 2.0 - length_m / 2.0).abs() / length_m
}

/// Name of the landmark closest to `point`.
pub fn nearest_name(point: GeoPoint, landmarks: &[&Waypoint]) -> Option<String> {
    landmarks
        .iter()
        .map(|landmark| (planar_distance_m(point, landmark.point()), landmark))
        .min_by(|(d1, _), (d2, _)| d1.total_cmp(d2))
        .map(|(_, landmark)| landmark.name.clone())
}
