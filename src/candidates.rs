//! Candidate generation: who could a commuter travel with?
//!
//! Counterparts go through the hard filters in a fixed order (spatial
//! proximity, transport mode, preference, gender, time window, cooldown,
//! overlap) and the first failure is recorded as the reason they were left
//! out. Survivors are scored, ranked and deduplicated.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, MatchingOptions, OverlapOptions};
use crate::haversine::minutes_at_speed;
use crate::model::{
    CommuteIntent, GroupSize, IntentStatus, Match, MatchId, MatchKind, SharedSegment, TransportMode,
    UserId, UserProfile,
};
use crate::overlap::{PreparedRoute, route_overlap};
use crate::scoring::{
    CompatibilityScore, Scorer, gender_compatible, group_interest_score, time_compatible,
};
use crate::spatial::{RouteCells, SpatialIndex, resolution};
use crate::store::pair_key;

/// Why a counterpart or group was not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfeasibleReason {
    /// Counterpart is already in an active match.
    AlreadyMatched,
    NoSpatialProximity,
    TransportModeMismatch,
    PreferenceMismatch,
    GroupSizeMismatch,
    GroupFull,
    GenderPreference,
    TimeWindow,
    Cooldown,
    PreviouslyDeclined,
    InsufficientOverlap,
    MissingProfile,
    MissingIntent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum CandidateTarget {
    User(UserId),
    Group(MatchId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CandidateKind {
    Individual,
    #[serde(rename_all = "camelCase")]
    NewGroup { min_size: u8, max_size: u8 },
    #[serde(rename_all = "camelCase")]
    JoinGroup { match_id: MatchId },
}

/// A ranked proposal for the focal commuter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    /// Deterministic key; breaks ties in the ranking.
    pub id: String,
    pub kind: CandidateKind,
    /// Everyone in the proposed match, focal user included, sorted.
    pub participants: Vec<UserId>,
    pub counterparts: Vec<UserId>,
    pub scores: CompatibilityScore,
    pub shared_segment: Option<SharedSegment>,
    pub transport_mode: TransportMode,
    pub estimated_shared_minutes: u32,
}

impl MatchCandidate {
    pub fn match_kind(&self, group_bounds: Option<GroupSize>) -> MatchKind {
        match (&self.kind, group_bounds) {
            (CandidateKind::NewGroup { min_size, max_size }, _) => MatchKind::Group {
                min_size: *min_size,
                max_size: *max_size,
            },
            (CandidateKind::JoinGroup { .. }, Some(bounds)) => MatchKind::Group {
                min_size: bounds.min,
                max_size: bounds.max,
            },
            _ => MatchKind::Individual,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub candidates: Vec<MatchCandidate>,
    pub rejected: Vec<(CandidateTarget, InfeasibleReason)>,
}

impl CandidateSet {
    pub fn rejection_for(&self, target: &CandidateTarget) -> Option<InfeasibleReason> {
        self.rejected
            .iter()
            .find(|(rejected, _)| rejected == target)
            .map(|(_, reason)| *reason)
    }
}

/// An intent with its comparison-ready geometry.
#[derive(Debug, Clone)]
pub struct PreparedIntent {
    pub intent: CommuteIntent,
    pub route: PreparedRoute,
    pub cells: RouteCells,
}

/// Prepared intents plus a spatial index over them.
#[derive(Debug, Default)]
pub struct PreparedPool {
    members: Vec<PreparedIntent>,
    by_user: HashMap<UserId, usize>,
    index: SpatialIndex,
}

impl PreparedPool {
    pub fn members(&self) -> &[PreparedIntent] {
        &self.members
    }

    pub fn get(&self, user: &UserId) -> Option<&PreparedIntent> {
        self.by_user.get(user).map(|position| &self.members[*position])
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Snapshot of a group match that still has room.
#[derive(Debug, Clone)]
pub struct OpenGroup {
    pub match_id: MatchId,
    pub min_size: u8,
    pub max_size: u8,
    pub participants: Vec<UserId>,
    pub declined: BTreeSet<UserId>,
}

impl OpenGroup {
    /// `None` for individual, terminal or full matches.
    pub fn from_match(record: &Match) -> Option<Self> {
        let MatchKind::Group { min_size, max_size } = record.kind else {
            return None;
        };
        if record.status.is_terminal() || !record.has_open_capacity() {
            return None;
        }
        Some(Self {
            match_id: record.id.clone(),
            min_size,
            max_size,
            participants: record.participants.clone(),
            declined: record
                .decisions
                .iter()
                .filter(|(_, decision)| decision.declined_at.is_some())
                .map(|(user, _)| user.clone())
                .collect(),
        })
    }
}

/// Read-only inputs shared by every evaluation in one scan.
#[derive(Debug, Clone, Copy)]
pub struct MatchingContext<'a> {
    pub profiles: &'a HashMap<UserId, UserProfile>,
    /// Cooldowns in force, keyed by `store::pair_key`.
    pub cooldowns: &'a HashMap<(UserId, UserId), DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl MatchingContext<'_> {
    fn in_cooldown(&self, a: &UserId, b: &UserId) -> bool {
        self.cooldowns
            .get(&pair_key(a, b))
            .is_some_and(|until| *until > self.now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Individual,
    Group,
}

/// Scores and geometry for a feasible set of participants.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub scores: CompatibilityScore,
    pub shared_segment: Option<SharedSegment>,
    /// Group bounds acceptable to every member; `None` for 1:1.
    pub group_bounds: Option<GroupSize>,
    pub estimated_shared_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    overlap: OverlapOptions,
    matching: MatchingOptions,
    scorer: Scorer,
}

impl CandidateGenerator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            overlap: config.overlap.clone(),
            matching: config.matching.clone(),
            scorer: Scorer::new(config.weights),
        }
    }

    pub fn prepare_one(&self, intent: &CommuteIntent) -> PreparedIntent {
        let route = PreparedRoute::from_intent(intent, &self.overlap);
        let cells = RouteCells::new(
            route.polyline.points(),
            resolution(self.matching.prefilter_resolution),
        );
        PreparedIntent {
            intent: intent.clone(),
            route,
            cells,
        }
    }

    pub fn prepare(&self, intents: &[CommuteIntent]) -> PreparedPool {
        let members: Vec<PreparedIntent> = intents
            .par_iter()
            .map(|intent| self.prepare_one(intent))
            .collect();
        let by_user = members
            .iter()
            .enumerate()
            .map(|(position, member)| (member.intent.user_id.clone(), position))
            .collect();
        let index = SpatialIndex::build(members.iter().map(|member| &member.cells));
        PreparedPool {
            members,
            by_user,
            index,
        }
    }

    /// Ranked candidates for `focal` drawn from `pool` and `groups`.
    pub fn generate(
        &self,
        focal: &CommuteIntent,
        pool: &PreparedPool,
        groups: &[OpenGroup],
        ctx: &MatchingContext<'_>,
    ) -> CandidateSet {
        let focal = self.prepare_one(focal);
        let focal_user = &focal.intent.user_id;
        let mut rejected: Vec<(CandidateTarget, InfeasibleReason)> = Vec::new();

        let nearby: Vec<usize> = if self.matching.spatial_prefilter {
            let nearby = pool.index.nearby(&focal.cells);
            for (position, member) in pool.members.iter().enumerate() {
                if !nearby.contains(&position) && member.intent.user_id != *focal_user {
                    rejected.push((
                        CandidateTarget::User(member.intent.user_id.clone()),
                        InfeasibleReason::NoSpatialProximity,
                    ));
                }
            }
            nearby.into_iter().collect()
        } else {
            (0..pool.members.len()).collect()
        };

        let pair_outcomes: Vec<(UserId, Result<MatchCandidate, InfeasibleReason>)> = nearby
            .par_iter()
            .filter_map(|position| {
                let other = &pool.members[*position];
                if other.intent.user_id == *focal_user {
                    return None;
                }
                Some((
                    other.intent.user_id.clone(),
                    self.pair_candidate(&focal, other, ctx),
                ))
            })
            .collect();

        let mut candidates: Vec<MatchCandidate> = Vec::new();
        for (user, outcome) in pair_outcomes {
            match outcome {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => rejected.push((CandidateTarget::User(user), reason)),
            }
        }

        if focal.intent.match_preference.allows_group() {
            for group in groups {
                match self.join_candidate(&focal, group, pool, ctx) {
                    Ok(candidate) => candidates.push(candidate),
                    Err(reason) => {
                        rejected.push((CandidateTarget::Group(group.match_id.clone()), reason))
                    }
                }
            }
        }

        for (target, reason) in &rejected {
            tracing::trace!(focal = %focal_user, ?target, ?reason, "candidate rejected");
        }

        let candidates = rank_and_dedup(candidates, self.matching.max_candidates);
        tracing::debug!(
            focal = %focal_user,
            pool = pool.len(),
            groups = groups.len(),
            offered = candidates.len(),
            rejected = rejected.len(),
            "candidate scan finished"
        );

        CandidateSet {
            candidates,
            rejected,
        }
    }

    fn pair_candidate(
        &self,
        focal: &PreparedIntent,
        other: &PreparedIntent,
        ctx: &MatchingContext<'_>,
    ) -> Result<MatchCandidate, InfeasibleReason> {
        if other.intent.status == IntentStatus::Matched {
            return Err(InfeasibleReason::AlreadyMatched);
        }

        let shape = pair_shape(&focal.intent, &other.intent);
        let evaluation = self.evaluate(&[focal, other], shape, ctx)?;

        let mut participants = vec![focal.intent.user_id.clone(), other.intent.user_id.clone()];
        participants.sort();
        let key = participants
            .iter()
            .map(UserId::as_str)
            .collect::<Vec<_>>()
            .join("+");

        let (id, kind) = match (shape, evaluation.group_bounds) {
            (Shape::Group, Some(bounds)) => (
                format!("group:{}", key),
                CandidateKind::NewGroup {
                    min_size: bounds.min,
                    max_size: bounds.max,
                },
            ),
            _ => (format!("individual:{}", key), CandidateKind::Individual),
        };

        Ok(MatchCandidate {
            id,
            kind,
            participants,
            counterparts: vec![other.intent.user_id.clone()],
            scores: evaluation.scores,
            shared_segment: evaluation.shared_segment,
            transport_mode: focal.intent.transport_mode,
            estimated_shared_minutes: evaluation.estimated_shared_minutes,
        })
    }

    fn join_candidate(
        &self,
        focal: &PreparedIntent,
        group: &OpenGroup,
        pool: &PreparedPool,
        ctx: &MatchingContext<'_>,
    ) -> Result<MatchCandidate, InfeasibleReason> {
        let focal_user = &focal.intent.user_id;
        if group.participants.contains(focal_user) {
            return Err(InfeasibleReason::AlreadyMatched);
        }
        if group.declined.contains(focal_user) {
            return Err(InfeasibleReason::PreviouslyDeclined);
        }
        if group.participants.len() >= usize::from(group.max_size) {
            return Err(InfeasibleReason::GroupFull);
        }

        let mut members: Vec<&PreparedIntent> = vec![focal];
        for user in &group.participants {
            members.push(pool.get(user).ok_or(InfeasibleReason::MissingIntent)?);
        }

        let evaluation = self.evaluate(&members, Shape::Group, ctx)?;
        let bounds = evaluation.group_bounds.ok_or(InfeasibleReason::GroupSizeMismatch)?;
        if bounds.min > group.max_size || bounds.max < group.min_size {
            return Err(InfeasibleReason::GroupSizeMismatch);
        }

        let mut participants = group.participants.clone();
        participants.push(focal_user.clone());
        participants.sort();

        Ok(MatchCandidate {
            id: format!("join:{}", group.match_id),
            kind: CandidateKind::JoinGroup {
                match_id: group.match_id.clone(),
            },
            participants,
            counterparts: group.participants.clone(),
            scores: evaluation.scores,
            shared_segment: evaluation.shared_segment,
            transport_mode: focal.intent.transport_mode,
            estimated_shared_minutes: evaluation.estimated_shared_minutes,
        })
    }

    /// Check that `members` could form a group together and score them.
    /// `members[0]` is the member the shared segment is reported for.
    pub fn evaluate_group(
        &self,
        members: &[&PreparedIntent],
        ctx: &MatchingContext<'_>,
    ) -> Result<Evaluation, InfeasibleReason> {
        self.evaluate(members, Shape::Group, ctx)
    }

    fn evaluate(
        &self,
        members: &[&PreparedIntent],
        shape: Shape,
        ctx: &MatchingContext<'_>,
    ) -> Result<Evaluation, InfeasibleReason> {
        let Some(focal) = members.first() else {
            return Err(InfeasibleReason::MissingIntent);
        };

        let mode = focal.intent.transport_mode;
        if members.iter().any(|member| member.intent.transport_mode != mode) {
            return Err(InfeasibleReason::TransportModeMismatch);
        }

        let group_bounds = match shape {
            Shape::Individual => {
                if members.len() != 2
                    || !members
                        .iter()
                        .all(|member| member.intent.match_preference.allows_individual())
                {
                    return Err(InfeasibleReason::PreferenceMismatch);
                }
                None
            }
            Shape::Group => {
                if !members
                    .iter()
                    .all(|member| member.intent.match_preference.allows_group())
                {
                    return Err(InfeasibleReason::PreferenceMismatch);
                }
                let bounds = members
                    .iter()
                    .try_fold(focal.intent.group_size, |acc, member| {
                        acc.intersect(member.intent.group_size)
                    })
                    .ok_or(InfeasibleReason::GroupSizeMismatch)?;
                if members.len() > usize::from(bounds.max) {
                    return Err(InfeasibleReason::GroupFull);
                }
                Some(bounds)
            }
        };

        let mut profiles: Vec<&UserProfile> = Vec::with_capacity(members.len());
        for member in members {
            profiles.push(
                ctx.profiles
                    .get(&member.intent.user_id)
                    .ok_or(InfeasibleReason::MissingProfile)?,
            );
        }

        let genders: Vec<_> = members
            .iter()
            .zip(&profiles)
            .map(|(member, profile)| (member.intent.gender_preference, profile.gender.as_str()))
            .collect();
        if !gender_compatible(&genders) {
            return Err(InfeasibleReason::GenderPreference);
        }

        let windows: Vec<_> = members.iter().map(|member| member.intent.time_window).collect();
        let time_overlap = time_compatible(&windows, self.matching.min_time_overlap_minutes)
            .ok_or(InfeasibleReason::TimeWindow)?;

        for (index, a) in members.iter().enumerate() {
            for b in &members[index + 1..] {
                if ctx.in_cooldown(&a.intent.user_id, &b.intent.user_id) {
                    return Err(InfeasibleReason::Cooldown);
                }
            }
        }

        let mut overlap_total = 0.0;
        let mut pairs = 0usize;
        let mut best_for_focal: Option<(f64, SharedSegment)> = None;
        for (index, a) in members.iter().enumerate() {
            for b in &members[index + 1..] {
                let overlap = route_overlap(&a.route, &b.route, &self.overlap);
                if overlap.score < self.matching.min_overlap_score {
                    return Err(InfeasibleReason::InsufficientOverlap);
                }
                overlap_total += overlap.score;
                pairs += 1;
                if index == 0 {
                    if let Some(shared) = overlap.shared {
                        let better = best_for_focal
                            .as_ref()
                            .is_none_or(|(score, _)| overlap.score > *score);
                        if better {
                            best_for_focal = Some((overlap.score, shared));
                        }
                    }
                }
            }
        }
        let overlap_score = if pairs == 0 { 0.0 } else { overlap_total / pairs as f64 };

        let interest_sets: Vec<_> = profiles.iter().map(|profile| &profile.interests).collect();
        let interest = group_interest_score(&interest_sets);
        let scores = self.scorer.score(overlap_score, interest, time_overlap);

        let shared_segment = best_for_focal.map(|(_, shared)| shared);
        let speed = match mode {
            TransportMode::Walk => self.matching.walk_speed_kmh,
            TransportMode::Transit => self.matching.transit_speed_kmh,
        };
        let estimated_shared_minutes = shared_segment
            .as_ref()
            .map_or(0, |shared| minutes_at_speed(shared.shared_distance_m, speed));

        Ok(Evaluation {
            scores,
            shared_segment,
            group_bounds,
            estimated_shared_minutes,
        })
    }
}

/// Which kind of match to propose between two people. `Both` on the focal
/// side prefers 1:1 when the counterpart allows it.
fn pair_shape(focal: &CommuteIntent, other: &CommuteIntent) -> Shape {
    let focal_pref = focal.match_preference;
    let other_pref = other.match_preference;
    if focal_pref.allows_individual() && other_pref.allows_individual() {
        Shape::Individual
    } else if focal_pref.allows_group() {
        Shape::Group
    } else {
        Shape::Individual
    }
}

/// Sort by composite score (descending) then id, and keep at most one
/// candidate per counterpart. Joining an existing group claims its members
/// before any pair candidate does.
pub fn rank_and_dedup(mut candidates: Vec<MatchCandidate>, limit: usize) -> Vec<MatchCandidate> {
    candidates.sort_by(|a, b| {
        b.scores
            .composite
            .total_cmp(&a.scores.composite)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut covered: HashSet<UserId> = HashSet::new();
    let mut keep = vec![false; candidates.len()];
    for joins in [true, false] {
        for (index, candidate) in candidates.iter().enumerate() {
            let is_join = matches!(candidate.kind, CandidateKind::JoinGroup { .. });
            if is_join != joins || candidate.counterparts.iter().any(|user| covered.contains(user)) {
                continue;
            }
            covered.extend(candidate.counterparts.iter().cloned());
            keep[index] = true;
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(candidate, kept)| kept.then_some(candidate))
        .take(limit)
        .collect()
}
