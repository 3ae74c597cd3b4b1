//! In-process implementations of the collaborator seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::EngineError;
use crate::events::MatchEvent;
use crate::model::{ChatRoomId, MatchId, UserId, UserProfile};
use crate::traits::{ChatRoomProvider, EventSink, ProfileProvider};

/// Profile directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let directory = Self::new();
        for profile in profiles {
            directory.insert(profile);
        }
        directory
    }

    pub fn insert(&self, profile: UserProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.id.clone(), profile);
        }
    }
}

impl ProfileProvider for InMemoryProfiles {
    fn profile(&self, user: &UserId) -> Result<UserProfile, EngineError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| EngineError::unavailable("profiles", "directory lock poisoned"))?;
        profiles
            .get(user)
            .cloned()
            .ok_or_else(|| EngineError::not_found("profile", user))
    }
}

/// Hands out `room-1`, `room-2`, ... in creation order.
#[derive(Debug, Default)]
pub struct SequentialChatRooms {
    next: AtomicU64,
}

impl SequentialChatRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl ChatRoomProvider for SequentialChatRooms {
    fn create_room(&self, _match_id: &MatchId, _participants: &[UserId]) -> Result<ChatRoomId, EngineError> {
        let number = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChatRoomId::new(format!("room-{}", number)))
    }
}

/// Keeps every published event.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<MatchEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MatchEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<MatchEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEvents {
    fn publish(&self, event: MatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
