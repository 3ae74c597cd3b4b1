//! HTTP adapters for the profile and chat services.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{ChatRoomId, MatchId, UserId, UserProfile};
use crate::traits::{ChatRoomProvider, ProfileProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServiceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl HttpServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn client(&self) -> Result<reqwest::blocking::Client, reqwest::Error> {
        reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()
    }
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 5,
        }
    }
}

/// Fetches profiles with `GET {base}/profiles/{user_id}`.
#[derive(Debug, Clone)]
pub struct HttpProfileService {
    config: HttpServiceConfig,
    client: reqwest::blocking::Client,
}

impl HttpProfileService {
    pub fn new(config: HttpServiceConfig) -> Result<Self, EngineError> {
        let client = config
            .client()
            .map_err(|err| EngineError::unavailable("profiles", err))?;
        Ok(Self { config, client })
    }
}

impl ProfileProvider for HttpProfileService {
    fn profile(&self, user: &UserId) -> Result<UserProfile, EngineError> {
        let url = self.config.url(&format!("profiles/{}", user));
        let response = self.client.get(url).send().map_err(|err| {
            tracing::warn!(user = %user, error = %err, "profile service request failed");
            EngineError::unavailable("profiles", err)
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::not_found("profile", user));
        }

        response
            .error_for_status()
            .and_then(|resp| resp.json::<UserProfile>())
            .map_err(|err| EngineError::unavailable("profiles", err))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest<'a> {
    match_id: &'a MatchId,
    participant_ids: &'a [UserId],
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    id: ChatRoomId,
}

/// Creates rooms with `POST {base}/rooms`. The match id is sent along so the
/// chat service can deduplicate retried activations.
#[derive(Debug, Clone)]
pub struct HttpChatRoomService {
    config: HttpServiceConfig,
    client: reqwest::blocking::Client,
}

impl HttpChatRoomService {
    pub fn new(config: HttpServiceConfig) -> Result<Self, EngineError> {
        let client = config
            .client()
            .map_err(|err| EngineError::unavailable("chat", err))?;
        Ok(Self { config, client })
    }
}

impl ChatRoomProvider for HttpChatRoomService {
    fn create_room(&self, match_id: &MatchId, participants: &[UserId]) -> Result<ChatRoomId, EngineError> {
        let body = CreateRoomRequest {
            match_id,
            participant_ids: participants,
        };

        self.client
            .post(self.config.url("rooms"))
            .json(&body)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.json::<CreateRoomResponse>())
            .map(|created| created.id)
            .map_err(|err| {
                tracing::warn!(match_id = %match_id, error = %err, "chat room creation failed");
                EngineError::unavailable("chat", err)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> HttpServiceConfig {
        // Port 9 (discard) is closed on any sane test host.
        HttpServiceConfig {
            base_url: "http://127.0.0.1:9/".to_string(),
            timeout_secs: 2,
        }
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = HttpServiceConfig::new("http://chat.local/");
        assert_eq!(config.url("rooms"), "http://chat.local/rooms");
    }

    #[test]
    fn test_profile_service_unreachable_maps_to_unavailable() {
        let service = HttpProfileService::new(unreachable()).expect("client");
        let err = service.profile(&UserId::new("ana")).unwrap_err();
        assert_eq!(err.kind(), "external_dependency_unavailable");
    }

    #[test]
    fn test_chat_service_unreachable_maps_to_unavailable() {
        let service = HttpChatRoomService::new(unreachable()).expect("client");
        let err = service
            .create_room(&MatchId::new("m1"), &[UserId::new("a"), UserId::new("b")])
            .unwrap_err();
        assert_eq!(err.kind(), "external_dependency_unavailable");
    }
}
