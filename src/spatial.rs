//! H3 bucketing used to skip counterparts whose routes never come close.
//!
//! Each route is reduced to the set of cells its sampled points fall in. Two
//! points within the coincidence threshold always land in the same or
//! adjacent cells as long as the cell edge is longer than the threshold, so
//! expanding one side by a k=1 disk never drops a real overlap. Resolution 8
//! (~460 m edge) is the default.

use std::collections::{BTreeSet, HashMap, HashSet};

use h3o::{CellIndex, LatLng, Resolution};

use crate::model::GeoPoint;

/// Cells touched by one route.
#[derive(Debug, Clone, Default)]
pub struct RouteCells {
    cells: HashSet<CellIndex>,
}

impl RouteCells {
    pub fn new(points: &[GeoPoint], resolution: Resolution) -> Self {
        let cells = points
            .iter()
            .filter_map(|point| LatLng::new(point.lat, point.lng).ok())
            .map(|latlng| latlng.to_cell(resolution))
            .collect();
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The route's cells plus their immediate neighbours.
    pub fn neighbourhood(&self) -> HashSet<CellIndex> {
        self.cells
            .iter()
            .flat_map(|cell| cell.grid_disk::<Vec<_>>(1))
            .collect()
    }
}

/// Cell → route position lookup over a pool of routes.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    by_cell: HashMap<CellIndex, Vec<usize>>,
}

impl SpatialIndex {
    pub fn build<'a>(routes: impl IntoIterator<Item = &'a RouteCells>) -> Self {
        let mut by_cell: HashMap<CellIndex, Vec<usize>> = HashMap::new();
        for (position, route) in routes.into_iter().enumerate() {
            for cell in &route.cells {
                by_cell.entry(*cell).or_default().push(position);
            }
        }
        Self { by_cell }
    }

    /// Positions of routes touching any cell near `route`.
    pub fn nearby(&self, route: &RouteCells) -> BTreeSet<usize> {
        route
            .neighbourhood()
            .iter()
            .filter_map(|cell| self.by_cell.get(cell))
            .flatten()
            .copied()
            .collect()
    }
}

/// Parse a configured resolution, falling back to 8 when out of range.
pub fn resolution(value: u8) -> Resolution {
    Resolution::try_from(value).unwrap_or(Resolution::Eight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn street(lat: f64, from_lng: f64, to_lng: f64, steps: usize) -> Vec<GeoPoint> {
        (0..=steps)
            .map(|step| {
                let t = step as f64 / steps as f64;
                GeoPoint::new(lat, from_lng + (to_lng - from_lng) * t)
            })
            .collect()
    }

    #[test]
    fn test_route_cells_nonempty() {
        let cells = RouteCells::new(&street(42.35, -71.08, -71.06, 40), Resolution::Eight);
        assert!(!cells.is_empty());
        assert!(cells.neighbourhood().len() > cells.len());
    }

    #[test]
    fn test_nearby_finds_parallel_route_not_distant_one() {
        let focal = RouteCells::new(&street(42.3500, -71.08, -71.06, 40), Resolution::Eight);
        let parallel = RouteCells::new(&street(42.3505, -71.08, -71.06, 40), Resolution::Eight);
        let distant = RouteCells::new(&street(42.4500, -71.20, -71.18, 40), Resolution::Eight);

        let index = SpatialIndex::build([&parallel, &distant]);
        let nearby = index.nearby(&focal);
        assert!(nearby.contains(&0));
        assert!(!nearby.contains(&1));
    }

    #[test]
    fn test_resolution_fallback() {
        assert_eq!(resolution(8), Resolution::Eight);
        assert_eq!(resolution(42), Resolution::Eight);
    }
}
