//! Transport-agnostic request dispatcher.
//!
//! Requests and responses are plain serde types so any transport (HTTP,
//! message queue, tests) can drive the engine with JSON.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{CandidateSummary, CommuteInput, MatchingEngine};
use crate::error::EngineError;
use crate::model::{CommuteIntent, Match, MatchId, MatchStatus, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    /// `PUT /commute`
    UpsertCommute { commute: CommuteInput },
    /// `DELETE /commute`
    ResetCommute,
    /// `POST /commute/queue`
    JoinQueue,
    /// `POST /commute/queue/leave`
    LeaveQueue,
    /// `POST /matching/run`
    RunMatching,
    /// `POST /matches/{id}/accept`
    #[serde(rename_all = "camelCase")]
    Accept { match_id: MatchId },
    /// `POST /matches/{id}/pass`
    #[serde(rename_all = "camelCase")]
    Pass { match_id: MatchId },
    /// `POST /matches/{id}/review`
    #[serde(rename_all = "camelCase")]
    Review { match_id: MatchId, enjoyed: bool },
    /// `GET /matches?status=`
    ListMatches {
        #[serde(default)]
        status: Option<MatchStatus>,
    },
    /// `GET /friends`
    ListFriends,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ApiResponse {
    Intent(CommuteIntent),
    Reset,
    Candidates(Vec<CandidateSummary>),
    Match(Match),
    Matches(Vec<Match>),
    Friends(Vec<UserId>),
}

/// Error body: `{"error": <kind>, "message": <text>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Api {
    engine: Arc<MatchingEngine>,
}

impl Api {
    pub fn new(engine: Arc<MatchingEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    /// Run `request` on behalf of the authenticated `user`.
    pub fn handle(&self, user: &UserId, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let engine = &self.engine;
        let response = match request {
            ApiRequest::UpsertCommute { commute } => ApiResponse::Intent(engine.upsert_commute(user, commute)?),
            ApiRequest::ResetCommute => {
                engine.reset_commute(user)?;
                ApiResponse::Reset
            }
            ApiRequest::JoinQueue => ApiResponse::Intent(engine.join_queue(user)?),
            ApiRequest::LeaveQueue => ApiResponse::Intent(engine.leave_queue(user)?),
            ApiRequest::RunMatching => ApiResponse::Candidates(engine.run_matching(user)?),
            ApiRequest::Accept { match_id } => ApiResponse::Match(engine.accept(&match_id, user)?),
            ApiRequest::Pass { match_id } => ApiResponse::Match(engine.decline(&match_id, user)?),
            ApiRequest::Review { match_id, enjoyed } => {
                ApiResponse::Match(engine.review(&match_id, user, enjoyed)?)
            }
            ApiRequest::ListMatches { status } => ApiResponse::Matches(engine.list_matches(user, status)),
            ApiRequest::ListFriends => ApiResponse::Friends(engine.friends(user)),
        };
        Ok(response)
    }

    /// JSON in, JSON out. Malformed requests come back as `invalid_input`.
    pub fn handle_json(&self, user: &UserId, body: &str) -> String {
        let result = serde_json::from_str::<ApiRequest>(body)
            .map_err(|err| ApiError::from(EngineError::invalid(err.to_string())))
            .and_then(|request| self.handle(user, request));

        let encoded = match &result {
            Ok(response) => serde_json::to_string(response),
            Err(err) => serde_json::to_string(err),
        };
        encoded.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "response encoding failed");
            format!(
                r#"{{"error":"invalid_input","message":"response encoding failed: {}"}}"#,
                err.to_string().replace('"', "'")
            )
        })
    }
}
