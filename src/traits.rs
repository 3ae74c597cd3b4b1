//! Seams to the systems the engine depends on but does not own.
//!
//! The engine only ever talks to these traits. `memory` and `http` provide
//! implementations; embedders can supply their own.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::events::MatchEvent;
use crate::model::{ChatRoomId, MatchId, UserId, UserProfile};

/// Read access to the external profile service.
pub trait ProfileProvider: Send + Sync {
    fn profile(&self, user: &UserId) -> Result<UserProfile, EngineError>;
}

/// Creates chat rooms for activated matches.
///
/// Must be safe to call again after a failure: activation is retried with
/// the same match id.
pub trait ChatRoomProvider: Send + Sync {
    fn create_room(&self, match_id: &MatchId, participants: &[UserId]) -> Result<ChatRoomId, EngineError>;
}

/// Receives lifecycle events for downstream consumers (chat, notifications).
pub trait EventSink: Send + Sync {
    fn publish(&self, event: MatchEvent);
}

impl EventSink for std::sync::mpsc::Sender<MatchEvent> {
    fn publish(&self, event: MatchEvent) {
        // A dropped receiver means nobody is listening; nothing to do.
        let _ = self.send(event);
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
