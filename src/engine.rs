//! The matching engine: intake, on-demand matching and housekeeping.
//!
//! Lifecycle operations live in `lifecycle`, queue operations in `queue`;
//! both extend `MatchingEngine`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candidates::{CandidateGenerator, CandidateKind, MatchCandidate, MatchingContext, OpenGroup};
use crate::clock::SystemClock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{
    CommuteIntent, Decision, GenderPreference, GroupSize, IntentId, IntentStatus, Match, MatchId,
    MatchOrigin, MatchPreference, MatchStatus, RouteSegment, SharedSegment, TimeWindow, TransportMode,
    UserId, UserProfile, Waypoint,
};
use crate::scoring::CompatibilityScore;
use crate::store::{IndexKey, MatchStore, lock_match};
use crate::traits::{ChatRoomProvider, Clock, EventSink, ProfileProvider};

/// What a user submits when creating or replacing their commute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommuteInput {
    pub start: Waypoint,
    pub end: Waypoint,
    pub route: Vec<RouteSegment>,
    pub time_window: TimeWindow,
    pub transport_mode: TransportMode,
    pub match_preference: MatchPreference,
    #[serde(default)]
    pub group_size: GroupSize,
    #[serde(default = "default_gender_preference")]
    pub gender_preference: GenderPreference,
}

fn default_gender_preference() -> GenderPreference {
    GenderPreference::Any
}

/// Public part of a profile shown alongside a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub id: UserId,
    pub name: String,
    pub occupation: String,
    pub interests: BTreeSet<String>,
}

impl From<&UserProfile> for ProfileSnapshot {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            occupation: profile.occupation.clone(),
            interests: profile.interests.clone(),
        }
    }
}

/// One entry in the ranked list returned by `run_matching`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub match_id: MatchId,
    pub kind: CandidateKind,
    pub status: MatchStatus,
    /// The other people in the proposed match.
    pub participants: Vec<ProfileSnapshot>,
    pub scores: CompatibilityScore,
    pub shared_segment: Option<SharedSegment>,
    pub transport_mode: TransportMode,
    pub estimated_shared_minutes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired: Vec<MatchId>,
    pub invitees_evicted: usize,
    pub removed: usize,
    pub cooldowns_purged: usize,
}

pub struct MatchingEngine {
    pub(crate) config: EngineConfig,
    pub(crate) generator: CandidateGenerator,
    pub(crate) store: MatchStore,
    pub(crate) profiles: Arc<dyn ProfileProvider>,
    pub(crate) chat: Arc<dyn ChatRoomProvider>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl MatchingEngine {
    pub fn new(
        config: EngineConfig,
        profiles: Arc<dyn ProfileProvider>,
        chat: Arc<dyn ChatRoomProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            generator: CandidateGenerator::new(&config),
            config,
            store: MatchStore::new(),
            profiles,
            chat,
            events,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &MatchStore {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    /// Create or replace the user's commute. Replacing keeps the intent id,
    /// its status, its queue flag and the match holding it.
    #[tracing::instrument(skip(self, input), fields(user = %user))]
    pub fn upsert_commute(&self, user: &UserId, input: CommuteInput) -> Result<CommuteIntent, EngineError> {
        let now = self.now();
        let mut intent = CommuteIntent {
            id: IntentId::new(Uuid::new_v4().to_string()),
            user_id: user.clone(),
            start: input.start,
            end: input.end,
            route: input.route,
            time_window: input.time_window,
            transport_mode: input.transport_mode,
            match_preference: input.match_preference,
            group_size: input.group_size,
            gender_preference: input.gender_preference,
            queueing: false,
            status: IntentStatus::Inactive,
            matched_by: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        intent
            .validate(self.config.matching.continuity_tolerance_m)
            .map_err(EngineError::InvalidInput)?;

        let stored = self.store.with_intents(|intents| {
            if let Some(existing) = intents.get(user) {
                intent.id = existing.id.clone();
                intent.queueing = existing.queueing;
                intent.status = existing.status;
                intent.matched_by = existing.matched_by.clone();
                intent.version = existing.version + 1;
                intent.created_at = existing.created_at;
            }
            intents.insert(user.clone(), intent.clone());
            intent
        });

        tracing::info!(intent = %stored.id, version = stored.version, "commute stored");
        Ok(stored)
    }

    #[tracing::instrument(skip(self), fields(user = %user))]
    pub fn reset_commute(&self, user: &UserId) -> Result<(), EngineError> {
        self.store
            .with_intents(|intents| intents.remove(user))
            .map(|removed| tracing::info!(intent = %removed.id, "commute removed"))
            .ok_or_else(|| EngineError::not_found("commute", user))
    }

    pub fn intent(&self, user: &UserId) -> Result<CommuteIntent, EngineError> {
        self.store
            .intent(user)
            .ok_or_else(|| EngineError::not_found("commute", user))
    }

    // ------------------------------------------------------------------
    // On-demand matching
    // ------------------------------------------------------------------

    /// Generate, persist and return ranked candidates for `user`.
    ///
    /// Suggestions already pending for the same participants are reused, so
    /// repeated calls do not pile up duplicate matches.
    #[tracing::instrument(skip(self), fields(user = %user))]
    pub fn run_matching(&self, user: &UserId) -> Result<Vec<CandidateSummary>, EngineError> {
        let focal = self.intent(user)?;
        let now = self.now();

        let intents = self.store.intents_snapshot();
        let groups = self.open_groups_for(user);

        let mut wanted: BTreeSet<UserId> = intents.iter().map(|intent| intent.user_id.clone()).collect();
        for group in &groups {
            wanted.extend(group.participants.iter().cloned());
        }
        let profiles = self.load_profiles(&wanted)?;
        if !profiles.contains_key(user) {
            return Err(EngineError::not_found("profile", user));
        }

        let cooldowns = self.store.active_cooldowns(now);
        let ctx = MatchingContext {
            profiles: &profiles,
            cooldowns: &cooldowns,
            now,
        };

        let pool = self.generator.prepare(&intents);
        let set = self.generator.generate(&focal, &pool, &groups, &ctx);

        let mut summaries = Vec::with_capacity(set.candidates.len());
        for candidate in &set.candidates {
            let Some(record) = self.persist_candidate(user, candidate, now) else {
                continue;
            };
            summaries.push(CandidateSummary {
                match_id: record.id.clone(),
                kind: candidate.kind.clone(),
                status: record.status,
                participants: candidate
                    .counterparts
                    .iter()
                    .filter_map(|other| profiles.get(other))
                    .map(ProfileSnapshot::from)
                    .collect(),
                scores: candidate.scores,
                shared_segment: candidate.shared_segment.clone(),
                transport_mode: candidate.transport_mode,
                estimated_shared_minutes: candidate.estimated_shared_minutes,
            });
        }

        tracing::info!(candidates = summaries.len(), "matching finished");
        Ok(summaries)
    }

    /// Group matches `user` could be offered. A group the user was invited
    /// to but has not answered is presented without them, so it is offered
    /// again rather than reported as already joined. Active groups drop
    /// their stale invitees first.
    fn open_groups_for(&self, user: &UserId) -> Vec<OpenGroup> {
        let now = self.now();
        let ttl = self.config.lifecycle.suggestion_ttl();
        self.store
            .matches_with_status(&[
                MatchStatus::Suggested,
                MatchStatus::PartiallyAccepted,
                MatchStatus::Active,
            ])
            .into_iter()
            .filter(|record| record.kind.is_group())
            .filter_map(|record| {
                if record.stale_invitees(now, ttl).is_empty() {
                    Some(record)
                } else {
                    self.evict_stale_invitees(&record.id, now).map(|(fresh, _)| fresh)
                }
            })
            .filter_map(|mut record| {
                if record.is_participant(user) {
                    if record.has_accepted(user) {
                        return None;
                    }
                    record.remove_participant(user);
                }
                OpenGroup::from_match(&record)
            })
            .collect()
    }

    /// Fetch profiles in parallel. Users without a profile are left out;
    /// an unavailable profile service fails the whole call.
    pub(crate) fn load_profiles<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
    ) -> Result<HashMap<UserId, UserProfile>, EngineError> {
        let users: Vec<&UserId> = users.into_iter().collect();
        let fetched: Vec<(UserId, Result<UserProfile, EngineError>)> = users
            .par_iter()
            .map(|user| ((*user).clone(), self.profiles.profile(user)))
            .collect();

        let mut profiles = HashMap::with_capacity(fetched.len());
        for (user, result) in fetched {
            match result {
                Ok(profile) => {
                    profiles.insert(user, profile);
                }
                Err(EngineError::NotFound { .. }) => {
                    tracing::debug!(user = %user, "no profile, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(profiles)
    }

    /// Store a candidate as a match, or find the one it already is.
    fn persist_candidate(&self, user: &UserId, candidate: &MatchCandidate, now: DateTime<Utc>) -> Option<Match> {
        if let CandidateKind::JoinGroup { match_id } = &candidate.kind {
            return self.invite_to_group(user, match_id, now);
        }

        let kind = candidate.match_kind(None);
        let existing = self.store.matches_for(user).into_iter().find(|record| {
            record.status.is_pending()
                && record.kind.is_group() == kind.is_group()
                && record.participants == candidate.participants
        });
        if let Some(record) = existing {
            return Some(record);
        }

        let record = Match {
            id: MatchId::new(Uuid::new_v4().to_string()),
            kind,
            participants: candidate.participants.clone(),
            decisions: candidate
                .participants
                .iter()
                .map(|participant| (participant.clone(), Decision::default()))
                .collect::<BTreeMap<_, _>>(),
            scores: candidate.scores,
            shared_segment: candidate.shared_segment.clone(),
            transport_mode: candidate.transport_mode,
            estimated_shared_minutes: candidate.estimated_shared_minutes,
            status: MatchStatus::Suggested,
            origin: MatchOrigin::OnDemand,
            chat_room_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        tracing::debug!(match_id = %record.id, candidate = %candidate.id, "suggestion created");
        self.store.insert_match(record.clone());
        Some(record)
    }

    fn invite_to_group(&self, user: &UserId, match_id: &MatchId, now: DateTime<Utc>) -> Option<Match> {
        let handle = self.store.handle(match_id)?;
        let mut record = lock_match(&handle);
        if record.is_participant(user) {
            return Some(record.clone());
        }
        // The group may have filled up or closed since the scan.
        if record.status.is_terminal() || !record.has_open_capacity() || record.has_declined(user) {
            tracing::debug!(match_id = %match_id, "group no longer open");
            return None;
        }

        let before = IndexKey::of(&record);
        record.add_participant(user.clone(), now);
        record.touch(now);
        self.store.reindex(&before, &record);
        tracing::debug!(match_id = %match_id, "invited to group");
        Some(record.clone())
    }

    /// Free the seats of invitees who never answered an active group.
    /// Returns the updated match and the number of members evicted.
    fn evict_stale_invitees(&self, match_id: &MatchId, now: DateTime<Utc>) -> Option<(Match, usize)> {
        let handle = self.store.handle(match_id)?;
        let mut record = lock_match(&handle);
        let stale = record.stale_invitees(now, self.config.lifecycle.suggestion_ttl());
        if stale.is_empty() {
            return Some((record.clone(), 0));
        }

        let before = IndexKey::of(&record);
        for user in &stale {
            record.evict(user);
        }
        record.touch(now);
        self.store.reindex(&before, &record);
        tracing::info!(match_id = %match_id, evicted = stale.len(), "stale invitees evicted");
        Some((record.clone(), stale.len()))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_match(&self, match_id: &MatchId) -> Result<Match, EngineError> {
        self.store
            .get_match(match_id)
            .ok_or_else(|| EngineError::not_found("match", match_id))
    }

    /// The user's matches, oldest first, optionally filtered by status.
    pub fn list_matches(&self, user: &UserId, status: Option<MatchStatus>) -> Vec<Match> {
        self.store
            .matches_for(user)
            .into_iter()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .collect()
    }

    pub fn friends(&self, user: &UserId) -> Vec<UserId> {
        self.store.friends(user).into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Expire stale suggestions, evict stale group invitees, drop old
    /// terminal matches and purge elapsed cooldowns. Expired matches give
    /// back the commutes they hold.
    #[tracing::instrument(skip(self))]
    pub fn sweep(&self) -> SweepReport {
        let now = self.now();
        let ttl = self.config.lifecycle.suggestion_ttl();
        let retention = self.config.lifecycle.retention();
        let mut report = SweepReport::default();

        let pending = self
            .store
            .matches_with_status(&[MatchStatus::Suggested, MatchStatus::PartiallyAccepted]);
        for snapshot in pending {
            if now - snapshot.created_at < ttl {
                continue;
            }
            let Some(handle) = self.store.handle(&snapshot.id) else {
                continue;
            };
            let mut record = lock_match(&handle);
            if !record.status.is_pending() || now - record.created_at < ttl {
                continue;
            }
            let before = IndexKey::of(&record);
            record.status = MatchStatus::Expired;
            self.release_intents(&record.id, &record.participants, now);
            record.touch(now);
            self.store.reindex(&before, &record);
            report.expired.push(record.id.clone());
        }

        for snapshot in self.store.matches_with_status(&[MatchStatus::Active]) {
            if snapshot.stale_invitees(now, ttl).is_empty() {
                continue;
            }
            if let Some((_, evicted)) = self.evict_stale_invitees(&snapshot.id, now) {
                report.invitees_evicted += evicted;
            }
        }

        let terminal = self.store.matches_with_status(&[
            MatchStatus::Completed,
            MatchStatus::Declined,
            MatchStatus::Expired,
        ]);
        for record in terminal {
            if now - record.updated_at >= retention && self.store.remove_match(&record.id).is_some() {
                report.removed += 1;
            }
        }

        report.cooldowns_purged = self.store.purge_cooldowns(now);

        if !report.expired.is_empty()
            || report.invitees_evicted > 0
            || report.removed > 0
            || report.cooldowns_purged > 0
        {
            tracing::info!(
                expired = report.expired.len(),
                evicted = report.invitees_evicted,
                removed = report.removed,
                cooldowns = report.cooldowns_purged,
                "sweep finished"
            );
        }
        report
    }
}
