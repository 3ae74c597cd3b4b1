//! Events published to the chat subsystem.

use serde::{Deserialize, Serialize};

use crate::model::{ChatRoomId, MatchId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchEvent {
    /// All required participants accepted; the chat room should be seeded
    /// with `icebreaker_text` as its first message.
    #[serde(rename = "match.activated", rename_all = "camelCase")]
    Activated {
        match_id: MatchId,
        chat_room_id: ChatRoomId,
        participant_ids: Vec<UserId>,
        icebreaker_text: String,
    },
    /// A user accepted an invitation into a group that was already active.
    #[serde(rename = "match.member_joined", rename_all = "camelCase")]
    MemberJoined {
        match_id: MatchId,
        chat_room_id: ChatRoomId,
        user_id: UserId,
    },
}

impl MatchEvent {
    pub fn match_id(&self) -> &MatchId {
        match self {
            MatchEvent::Activated { match_id, .. } | MatchEvent::MemberJoined { match_id, .. } => {
                match_id
            }
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and vectors cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
