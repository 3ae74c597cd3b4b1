//! Test fixtures for commute-match.
//!
//! Provides realistic test data including:
//! - Real Boston locations (from OpenStreetMap)
//! - Builders for commutes and profiles
//! - A harness wiring the engine to in-memory collaborators

#![allow(dead_code)]

pub mod boston_locations;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use commute_match::clock::ManualClock;
use commute_match::engine::{CommuteInput, MatchingEngine};
use commute_match::error::EngineError;
use commute_match::memory::{InMemoryProfiles, RecordingEvents, SequentialChatRooms};
use commute_match::model::{
    ChatRoomId, CommuteIntent, GenderPreference, GroupSize, MatchId, MatchPreference, RouteSegment,
    TimeWindow, TransportMode, UserId, UserProfile,
};
use commute_match::traits::ChatRoomProvider;
use commute_match::EngineConfig;

pub use boston_locations::*;

// ============================================================================
// Commute builder
// ============================================================================

/// Builder for test commutes with sensible defaults.
#[derive(Debug, Clone)]
pub struct TestCommute {
    stops: Vec<Location>,
    window: TimeWindow,
    mode: TransportMode,
    preference: MatchPreference,
    group_size: GroupSize,
    gender: GenderPreference,
}

impl TestCommute {
    pub fn along(stops: &[Location]) -> Self {
        Self {
            stops: stops.to_vec(),
            window: TimeWindow::from_hm((8, 0), (9, 0)),
            mode: TransportMode::Walk,
            preference: MatchPreference::Individual,
            group_size: GroupSize::default(),
            gender: GenderPreference::Any,
        }
    }

    pub fn window(mut self, start: (u16, u16), end: (u16, u16)) -> Self {
        self.window = TimeWindow::from_hm(start, end);
        self
    }

    pub fn transit(mut self) -> Self {
        self.mode = TransportMode::Transit;
        self
    }

    pub fn preference(mut self, preference: MatchPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn group(mut self, min: u8, max: u8) -> Self {
        self.preference = MatchPreference::Group;
        self.group_size = GroupSize::new(min, max);
        self
    }

    pub fn same_gender(mut self) -> Self {
        self.gender = GenderPreference::Same;
        self
    }

    pub fn input(&self) -> CommuteInput {
        let points = self.stops.iter().map(Location::point).collect();
        let segment = match self.mode {
            TransportMode::Walk => RouteSegment::walk(points),
            TransportMode::Transit => RouteSegment::transit("Green Line", points),
        };
        CommuteInput {
            start: self.stops[0].waypoint(),
            end: self.stops[self.stops.len() - 1].waypoint(),
            route: vec![segment],
            time_window: self.window,
            transport_mode: self.mode,
            match_preference: self.preference,
            group_size: self.group_size,
            gender_preference: self.gender,
        }
    }
}

pub fn profile(id: &str, gender: &str, interests: &[&str]) -> UserProfile {
    UserProfile {
        id: UserId::new(id),
        name: id.to_uppercase(),
        occupation: "Engineer".to_string(),
        gender: gender.to_string(),
        interests: interests.iter().map(|tag| tag.to_string()).collect::<BTreeSet<_>>(),
    }
}

// ============================================================================
// Chat service stub
// ============================================================================

/// Sequential rooms that can be switched into failure mode.
#[derive(Debug, Default)]
pub struct FlakyChatRooms {
    failing: AtomicBool,
    rooms: SequentialChatRooms,
}

impl FlakyChatRooms {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn created(&self) -> u64 {
        self.rooms.created()
    }
}

impl ChatRoomProvider for FlakyChatRooms {
    fn create_room(&self, match_id: &MatchId, participants: &[UserId]) -> Result<ChatRoomId, EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::unavailable("chat", "connection refused"));
        }
        self.rooms.create_room(match_id, participants)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).single().expect("valid timestamp")
}

pub struct Harness {
    pub engine: Arc<MatchingEngine>,
    pub profiles: Arc<InMemoryProfiles>,
    pub chat: Arc<FlakyChatRooms>,
    pub events: Arc<RecordingEvents>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let profiles = Arc::new(InMemoryProfiles::new());
        let chat = Arc::new(FlakyChatRooms::default());
        let events = Arc::new(RecordingEvents::new());
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let engine = MatchingEngine::new(config, profiles.clone(), chat.clone(), events.clone())
            .expect("valid config")
            .with_clock(clock.clone());
        Self {
            engine: Arc::new(engine),
            profiles,
            chat,
            events,
            clock,
        }
    }

    /// Register a profile and store a commute for it.
    pub fn add(&self, profile: UserProfile, commute: TestCommute) -> CommuteIntent {
        let user = profile.id.clone();
        self.profiles.insert(profile);
        self.engine
            .upsert_commute(&user, commute.input())
            .expect("valid commute")
    }
}

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}
