//! Core data model: commute intents, profiles, routes and matches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::haversine::planar_distance_m;
use crate::scoring::CompatibilityScore;

/// Minutes in a day; time windows wrap at this value.
pub const MINUTES_PER_DAY: u16 = 1440;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a user, owned by the external profile service.
    UserId
);
string_id!(IntentId);
string_id!(MatchId);
string_id!(ChatRoomId);

/// A (latitude, longitude) pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A named location, used for route endpoints and shared-segment labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    pub name: String,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            name: name.into(),
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Walk,
    Transit,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Walk => f.write_str("walk"),
            TransportMode::Transit => f.write_str("transit"),
        }
    }
}

/// One leg of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSegment {
    pub points: Vec<GeoPoint>,
    pub kind: TransportMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit_line: Option<String>,
}

impl RouteSegment {
    pub fn walk(points: Vec<GeoPoint>) -> Self {
        Self {
            points,
            kind: TransportMode::Walk,
            transit_line: None,
        }
    }

    pub fn transit(line: impl Into<String>, points: Vec<GeoPoint>) -> Self {
        Self {
            points,
            kind: TransportMode::Transit,
            transit_line: Some(line.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPreference {
    Individual,
    Group,
    Both,
}

impl MatchPreference {
    pub fn allows_individual(self) -> bool {
        matches!(self, MatchPreference::Individual | MatchPreference::Both)
    }

    pub fn allows_group(self) -> bool {
        matches!(self, MatchPreference::Group | MatchPreference::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderPreference {
    Any,
    Same,
}

/// Inclusive bounds on the number of people in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSize {
    pub min: u8,
    pub max: u8,
}

impl GroupSize {
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    /// Bounds acceptable to both sides, if any.
    pub fn intersect(self, other: GroupSize) -> Option<GroupSize> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(GroupSize { min, max })
    }

    pub fn contains(self, size: usize) -> bool {
        size >= self.min as usize && size <= self.max as usize
    }
}

impl Default for GroupSize {
    fn default() -> Self {
        Self { min: 2, max: 4 }
    }
}

/// Departure/arrival window as minutes past midnight.
///
/// A window whose start is later than its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub earliest_departure: u16,
    pub latest_arrival: u16,
}

impl TimeWindow {
    pub const fn new(earliest_departure: u16, latest_arrival: u16) -> Self {
        Self {
            earliest_departure,
            latest_arrival,
        }
    }

    /// Convenience constructor from clock times.
    pub const fn from_hm(start: (u16, u16), end: (u16, u16)) -> Self {
        Self::new(start.0 * 60 + start.1, end.0 * 60 + end.1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.earliest_departure >= MINUTES_PER_DAY || self.latest_arrival >= MINUTES_PER_DAY {
            return Err(format!(
                "time window {}..{} outside 0..{}",
                self.earliest_departure, self.latest_arrival, MINUTES_PER_DAY
            ));
        }
        if self.earliest_departure == self.latest_arrival {
            return Err("time window has zero length".to_string());
        }
        Ok(())
    }

    pub fn duration_minutes(&self) -> u16 {
        if self.latest_arrival > self.earliest_departure {
            self.latest_arrival - self.earliest_departure
        } else {
            self.latest_arrival + MINUTES_PER_DAY - self.earliest_departure
        }
    }

    /// Minutes shared by both windows on the 24h circle.
    pub fn intersection_minutes(&self, other: &TimeWindow) -> u16 {
        let a_start = i32::from(self.earliest_departure);
        let a_end = a_start + i32::from(self.duration_minutes());
        let b_start = i32::from(other.earliest_departure);
        let b_len = i32::from(other.duration_minutes());
        let day = i32::from(MINUTES_PER_DAY);

        let shared: i32 = [-day, 0, day]
            .iter()
            .map(|shift| {
                let start = a_start.max(b_start + shift);
                let end = a_end.min(b_start + shift + b_len);
                (end - start).max(0)
            })
            .sum();

        shared.min(day) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Inactive,
    Queued,
    Matched,
}

/// A user's standing request to be matched for a route and time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommuteIntent {
    pub id: IntentId,
    pub user_id: UserId,
    pub start: Waypoint,
    pub end: Waypoint,
    pub route: Vec<RouteSegment>,
    pub time_window: TimeWindow,
    pub transport_mode: TransportMode,
    pub match_preference: MatchPreference,
    pub group_size: GroupSize,
    pub gender_preference: GenderPreference,
    pub queueing: bool,
    pub status: IntentStatus,
    /// The match holding this commute while it is `matched`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<MatchId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommuteIntent {
    pub fn is_queued(&self) -> bool {
        self.queueing && self.status == IntentStatus::Queued
    }

    pub fn route_points(&self) -> impl Iterator<Item = GeoPoint> + '_ {
        self.route.iter().flat_map(|segment| segment.points.iter().copied())
    }

    /// Intake validation. `continuity_tolerance_m` bounds the gap allowed
    /// between consecutive segments.
    pub fn validate(&self, continuity_tolerance_m: f64) -> Result<(), String> {
        self.time_window.validate()?;

        if self.group_size.min < 2 {
            return Err(format!("group size min {} is below 2", self.group_size.min));
        }
        if self.group_size.min > self.group_size.max {
            return Err(format!(
                "group size min {} exceeds max {}",
                self.group_size.min, self.group_size.max
            ));
        }

        if !self.start.point().is_valid() || !self.end.point().is_valid() {
            return Err("start or end waypoint has invalid coordinates".to_string());
        }

        if self.route.is_empty() {
            return Err("route is empty".to_string());
        }
        if self.route.iter().any(|segment| segment.points.is_empty()) {
            return Err("route contains an empty segment".to_string());
        }
        if self.route_points().count() < 2 {
            return Err("route needs at least two points".to_string());
        }
        if let Some(point) = self.route_points().find(|point| !point.is_valid()) {
            return Err(format!("route point ({}, {}) is invalid", point.lat, point.lng));
        }

        for (index, pair) in self.route.windows(2).enumerate() {
            let (Some(last), Some(first)) = (pair[0].points.last(), pair[1].points.first()) else {
                continue;
            };
            let gap = planar_distance_m(*last, *first);
            if gap > continuity_tolerance_m {
                return Err(format!(
                    "segments {} and {} are {:.0} m apart",
                    index,
                    index + 1,
                    gap
                ));
            }
        }

        Ok(())
    }
}

/// Read-only profile supplied by the external profile service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub occupation: String,
    pub gender: String,
    #[serde(default)]
    pub interests: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MatchKind {
    Individual,
    #[serde(rename_all = "camelCase")]
    Group { min_size: u8, max_size: u8 },
}

impl MatchKind {
    /// Accepted participants needed before the match activates.
    pub fn activation_threshold(&self) -> usize {
        match self {
            MatchKind::Individual => 2,
            MatchKind::Group { min_size, .. } => usize::from(*min_size),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            MatchKind::Individual => 2,
            MatchKind::Group { max_size, .. } => usize::from(*max_size),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, MatchKind::Group { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Suggested,
    PartiallyAccepted,
    Active,
    Completed,
    Declined,
    Expired,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::Declined | MatchStatus::Expired
        )
    }

    /// Still waiting on decisions.
    pub fn is_pending(self) -> bool {
        matches!(self, MatchStatus::Suggested | MatchStatus::PartiallyAccepted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Suggested => "suggested",
            MatchStatus::PartiallyAccepted => "partially_accepted",
            MatchStatus::Active => "active",
            MatchStatus::Completed => "completed",
            MatchStatus::Declined => "declined",
            MatchStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrigin {
    OnDemand,
    Queue,
}

/// Per-participant decision record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Set for members added to an existing group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn is_undecided(&self) -> bool {
        self.accepted_at.is_none() && self.declined_at.is_none()
    }
}

/// Where two commuters travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSegment {
    pub meet_point: GeoPoint,
    pub split_point: GeoPoint,
    pub meet_name: Option<String>,
    pub split_name: Option<String>,
    pub shared_distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub kind: MatchKind,
    /// Current participants, sorted. Declined group members are removed
    /// here but keep their entry in `decisions`.
    pub participants: Vec<UserId>,
    pub decisions: BTreeMap<UserId, Decision>,
    pub scores: CompatibilityScore,
    pub shared_segment: Option<SharedSegment>,
    pub transport_mode: TransportMode,
    pub estimated_shared_minutes: u32,
    pub status: MatchStatus,
    pub origin: MatchOrigin,
    pub chat_room_id: Option<ChatRoomId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.binary_search(user).is_ok()
    }

    pub fn accepted_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|user| {
                self.decisions
                    .get(*user)
                    .is_some_and(|decision| decision.accepted_at.is_some())
            })
            .count()
    }

    pub fn has_declined(&self, user: &UserId) -> bool {
        self.decisions
            .get(user)
            .is_some_and(|decision| decision.declined_at.is_some())
    }

    pub fn has_accepted(&self, user: &UserId) -> bool {
        self.decisions
            .get(user)
            .is_some_and(|decision| decision.accepted_at.is_some())
    }

    pub fn has_open_capacity(&self) -> bool {
        self.participants.len() < self.kind.capacity()
    }

    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |other| *other != user)
    }

    /// Undecided members of an active group whose invitation is older than
    /// `ttl`. Members of the original suggestion count from its creation.
    pub fn stale_invitees(&self, now: DateTime<Utc>, ttl: TimeDelta) -> Vec<UserId> {
        if !self.kind.is_group() || self.status != MatchStatus::Active {
            return Vec::new();
        }
        self.participants
            .iter()
            .filter(|user| {
                let decision = self.decisions.get(*user).cloned().unwrap_or_default();
                decision.is_undecided() && now - decision.invited_at.unwrap_or(self.created_at) >= ttl
            })
            .cloned()
            .collect()
    }

    pub(crate) fn add_participant(&mut self, user: UserId, now: DateTime<Utc>) {
        if let Err(position) = self.participants.binary_search(&user) {
            self.participants.insert(position, user.clone());
        }
        self.decisions.entry(user).or_default().invited_at = Some(now);
    }

    /// Drop a member who never answered; unlike a pass, no trace is kept.
    pub(crate) fn evict(&mut self, user: &UserId) {
        self.remove_participant(user);
        self.decisions.remove(user);
    }

    pub(crate) fn remove_participant(&mut self, user: &UserId) {
        self.participants.retain(|other| other != user);
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}
