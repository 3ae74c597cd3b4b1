//! Real Boston / Quincy locations for realistic test fixtures.
//!
//! Coordinates sourced from OpenStreetMap.

use commute_match::model::{GeoPoint, Waypoint};

/// A named location with coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub name: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(name: &'static str, lat: f64, lng: f64) -> Self {
        Self { name, lat, lng }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    pub fn waypoint(&self) -> Waypoint {
        Waypoint::new(self.name, self.lat, self.lng)
    }
}

// ============================================================================
// Downtown → Back Bay corridor (Tremont St / Boylston St)
// ============================================================================

pub const DOWNTOWN_CROSSING: Location = Location::new("Downtown Crossing", 42.3555, -71.0605);
pub const BOSTON_COMMON: Location = Location::new("Boston Common", 42.3550, -71.0656);
pub const PUBLIC_GARDEN: Location = Location::new("Public Garden", 42.3535, -71.0700);
pub const BACK_BAY: Location = Location::new("Back Bay", 42.3503, -71.0810);

// ============================================================================
// North End (perpendicular to the corridor)
// ============================================================================

pub const HAYMARKET: Location = Location::new("Haymarket", 42.3627, -71.0582);
pub const GOVERNMENT_CENTER: Location = Location::new("Government Center", 42.3597, -71.0592);
pub const STATE_STREET: Location = Location::new("State Street", 42.3588, -71.0578);

// ============================================================================
// Quincy (well outside the downtown cells)
// ============================================================================

pub const QUINCY_CENTER: Location = Location::new("Quincy Center", 42.2518, -71.0054);
pub const WOLLASTON: Location = Location::new("Wollaston", 42.2665, -71.0203);

/// Downtown Crossing → Back Bay along Tremont and Boylston.
pub const DOWNTOWN_TO_BACK_BAY: &[Location] =
    &[DOWNTOWN_CROSSING, BOSTON_COMMON, PUBLIC_GARDEN, BACK_BAY];

/// Boston Common → Back Bay, the western part of the corridor.
pub const COMMON_TO_BACK_BAY: &[Location] = &[BOSTON_COMMON, PUBLIC_GARDEN, BACK_BAY];

/// Back Bay → Downtown Crossing, the corridor in reverse.
pub const BACK_BAY_TO_DOWNTOWN: &[Location] =
    &[BACK_BAY, PUBLIC_GARDEN, BOSTON_COMMON, DOWNTOWN_CROSSING];

/// Haymarket → State Street, north of the corridor.
pub const HAYMARKET_TO_STATE: &[Location] = &[HAYMARKET, GOVERNMENT_CENTER, STATE_STREET];

pub const QUINCY_TO_WOLLASTON: &[Location] = &[QUINCY_CENTER, WOLLASTON];
