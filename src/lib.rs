//! commute-match
//!
//! Matches commuters who travel the same way at the same time, either 1:1
//! or in small groups, on demand or through a periodically drained queue.

pub mod api;
pub mod candidates;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod haversine;
pub mod http;
pub mod icebreaker;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod overlap;
pub mod polyline;
pub mod queue;
pub mod scoring;
pub mod spatial;
pub mod store;
pub mod traits;

pub use api::{Api, ApiError, ApiRequest, ApiResponse};
pub use config::EngineConfig;
pub use engine::{CandidateSummary, CommuteInput, MatchingEngine};
pub use error::EngineError;
pub use queue::{QueueRunReport, QueueWorker};
