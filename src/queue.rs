//! Queue membership and the periodic queue matcher.
//!
//! A run scans every queued intent against the other queued intents in
//! parallel, then walks seeds in intent-id order and assigns each one to
//! its best candidate whose members are still free. Assignments commit
//! optimistically against intent versions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candidates::{CandidateKind, CandidateSet, MatchCandidate, MatchingContext, PreparedPool};
use crate::engine::MatchingEngine;
use crate::error::EngineError;
use crate::model::{
    CommuteIntent, Decision, GroupSize, IntentStatus, Match, MatchId, MatchKind, MatchOrigin,
    MatchStatus, SharedSegment, TransportMode, UserId, UserProfile,
};
use crate::scoring::CompatibilityScore;
use crate::store::{IndexKey, lock_match};

/// Outcome of one queue run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRunReport {
    pub queued: usize,
    pub matches_created: Vec<MatchId>,
    pub activated: Vec<MatchId>,
    /// Activations retried for matches left without a chat room.
    pub activations_retried: Vec<MatchId>,
    pub activation_failures: Vec<MatchId>,
    /// Seeds whose commit lost a race twice.
    pub conflicts: Vec<UserId>,
    /// Seeds with no assignable candidate this run.
    pub unmatched: Vec<UserId>,
    /// Seeds not visited because the run budget ran out.
    pub deferred: Vec<UserId>,
}

/// A group of queued users ready to be committed together.
#[derive(Debug, Clone)]
struct Proposal {
    kind: MatchKind,
    /// Each member with the intent version the proposal was built from.
    members: BTreeMap<UserId, u64>,
    scores: CompatibilityScore,
    shared_segment: Option<SharedSegment>,
    transport_mode: TransportMode,
    estimated_shared_minutes: u32,
}

/// Inputs of one scan, rebuilt when a commit has to be retried.
struct QueueScan {
    queued: Vec<CommuteIntent>,
    pool: PreparedPool,
    profiles: HashMap<UserId, UserProfile>,
    cooldowns: HashMap<(UserId, UserId), DateTime<Utc>>,
    now: DateTime<Utc>,
}

impl QueueScan {
    fn ctx(&self) -> MatchingContext<'_> {
        MatchingContext {
            profiles: &self.profiles,
            cooldowns: &self.cooldowns,
            now: self.now,
        }
    }
}

impl MatchingEngine {
    /// Put the user's commute in the queue. Joining twice is a no-op.
    #[tracing::instrument(skip(self), fields(user = %user))]
    pub fn join_queue(&self, user: &UserId) -> Result<CommuteIntent, EngineError> {
        let now = self.now();
        let outcome = self.store.with_intents(|intents| {
            let Some(intent) = intents.get_mut(user) else {
                return Err(None);
            };
            match intent.status {
                IntentStatus::Matched => Err(Some(intent.clone())),
                IntentStatus::Queued => Ok(intent.clone()),
                IntentStatus::Inactive => {
                    intent.status = IntentStatus::Queued;
                    intent.queueing = true;
                    intent.version += 1;
                    intent.updated_at = now;
                    Ok(intent.clone())
                }
            }
        });

        match outcome {
            Ok(intent) => {
                tracing::info!(intent = %intent.id, "joined queue");
                Ok(intent)
            }
            Err(None) => Err(EngineError::not_found("commute", user)),
            Err(Some(intent)) => {
                tracing::debug!(intent = %intent.id, "queue closed while matched");
                // Looked up after the intent lock is released.
                let holder = intent
                    .matched_by
                    .as_ref()
                    .and_then(|match_id| self.store.get_match(match_id));
                Err(match holder {
                    Some(record) => EngineError::InvalidStateTransition {
                        match_id: record.id,
                        status: record.status,
                        action: "join queue",
                    },
                    None => EngineError::invalid("commute is already matched"),
                })
            }
        }
    }

    /// Take the user's commute out of the queue. Leaving twice is a no-op.
    #[tracing::instrument(skip(self), fields(user = %user))]
    pub fn leave_queue(&self, user: &UserId) -> Result<CommuteIntent, EngineError> {
        let now = self.now();
        self.store
            .with_intents(|intents| {
                let intent = intents.get_mut(user)?;
                if intent.queueing || intent.status == IntentStatus::Queued {
                    intent.queueing = false;
                    if intent.status == IntentStatus::Queued {
                        intent.status = IntentStatus::Inactive;
                    }
                    intent.version += 1;
                    intent.updated_at = now;
                    tracing::info!(intent = %intent.id, "left queue");
                }
                Some(intent.clone())
            })
            .ok_or_else(|| EngineError::not_found("commute", user))
    }

    /// Assign queued commuters into active matches.
    #[tracing::instrument(skip(self))]
    pub fn run_queue(&self) -> Result<QueueRunReport, EngineError> {
        let started = Instant::now();
        let budget = self.config.queue.run_budget();
        let mut report = QueueRunReport::default();

        self.retry_stuck_activations(&mut report);

        let mut scan = self.scan_queue(&HashSet::new())?;
        report.queued = scan.queued.len();
        if scan.queued.len() < 2 {
            report.unmatched = scan.queued.iter().map(|intent| intent.user_id.clone()).collect();
            return Ok(report);
        }

        let sets: Vec<CandidateSet> = {
            let ctx = scan.ctx();
            scan.queued
                .par_iter()
                .map(|intent| self.generator.generate(intent, &scan.pool, &[], &ctx))
                .collect()
        };

        let seeds: Vec<CommuteIntent> = scan.queued.clone();
        let mut assigned: HashSet<UserId> = HashSet::new();

        for (position, seed) in seeds.iter().enumerate() {
            if started.elapsed() >= budget {
                report.deferred.extend(
                    seeds[position..]
                        .iter()
                        .filter(|intent| !assigned.contains(&intent.user_id))
                        .map(|intent| intent.user_id.clone()),
                );
                tracing::warn!(deferred = report.deferred.len(), "queue run budget exhausted");
                break;
            }
            if assigned.contains(&seed.user_id) {
                continue;
            }

            let Some(proposal) = self.propose(seed, &sets[position], &scan, &assigned) else {
                report.unmatched.push(seed.user_id.clone());
                continue;
            };

            let committed = match self.commit(&proposal) {
                Err(EngineError::ConcurrentAssignmentConflict(reason)) => {
                    tracing::warn!(seed = %seed.user_id, %reason, "queue commit conflict, rescanning");
                    scan = self.scan_queue(&assigned)?;
                    self.retry_seed(&seed.user_id, &scan, &assigned)
                }
                other => other.map(Some),
            };

            match committed {
                Ok(Some((match_id, members, activated))) => {
                    assigned.extend(members);
                    report.matches_created.push(match_id.clone());
                    if activated {
                        report.activated.push(match_id);
                    } else {
                        report.activation_failures.push(match_id);
                    }
                }
                Ok(None) => report.unmatched.push(seed.user_id.clone()),
                Err(EngineError::ConcurrentAssignmentConflict(reason)) => {
                    tracing::warn!(seed = %seed.user_id, %reason, "queue commit conflict after retry");
                    report.conflicts.push(seed.user_id.clone());
                }
                Err(err) => return Err(err),
            }
        }

        report.unmatched.retain(|user| !assigned.contains(user));
        tracing::info!(
            queued = report.queued,
            created = report.matches_created.len(),
            conflicts = report.conflicts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "queue run finished"
        );
        Ok(report)
    }

    fn retry_stuck_activations(&self, report: &mut QueueRunReport) {
        let stuck = self
            .store
            .matches_with_status(&[MatchStatus::PartiallyAccepted])
            .into_iter()
            .filter(|record| {
                record.origin == MatchOrigin::Queue
                    && record.accepted_count() >= record.kind.activation_threshold()
            });
        for record in stuck {
            report.activations_retried.push(record.id.clone());
            match self.retry_activation(&record.id) {
                Ok(updated) if updated.status == MatchStatus::Active => report.activated.push(record.id),
                Ok(_) => tracing::debug!(match_id = %record.id, "activation withdrawn"),
                Err(err) => {
                    tracing::warn!(match_id = %record.id, error = %err, "activation retry failed");
                    report.activation_failures.push(record.id);
                }
            }
        }
    }

    /// Snapshot the queue, leaving out users already assigned this run.
    fn scan_queue(&self, assigned: &HashSet<UserId>) -> Result<QueueScan, EngineError> {
        let queued: Vec<CommuteIntent> = self
            .store
            .intents_snapshot()
            .into_iter()
            .filter(|intent| intent.is_queued() && !assigned.contains(&intent.user_id))
            .collect();
        let profiles = self.load_profiles(queued.iter().map(|intent| &intent.user_id))?;
        let now = self.now();
        let cooldowns = self.store.active_cooldowns(now);
        let pool = self.generator.prepare(&queued);
        Ok(QueueScan {
            queued,
            pool,
            profiles,
            cooldowns,
            now,
        })
    }

    fn retry_seed(
        &self,
        seed: &UserId,
        scan: &QueueScan,
        assigned: &HashSet<UserId>,
    ) -> Result<Option<(MatchId, Vec<UserId>, bool)>, EngineError> {
        let Some(fresh) = scan.queued.iter().find(|intent| intent.user_id == *seed) else {
            return Ok(None);
        };
        let set = self.generator.generate(fresh, &scan.pool, &[], &scan.ctx());
        match self.propose(fresh, &set, scan, assigned) {
            Some(proposal) => self.commit(&proposal).map(Some),
            None => Ok(None),
        }
    }

    /// Pick the best candidate free of assigned users and, for groups,
    /// grow it with further compatible queued users.
    fn propose(
        &self,
        seed: &CommuteIntent,
        set: &CandidateSet,
        scan: &QueueScan,
        assigned: &HashSet<UserId>,
    ) -> Option<Proposal> {
        let ctx = scan.ctx();
        let free = |candidate: &&MatchCandidate| {
            candidate.participants.iter().all(|user| !assigned.contains(user))
        };

        for candidate in set.candidates.iter().filter(free) {
            let members = |users: &[UserId]| -> Option<BTreeMap<UserId, u64>> {
                users
                    .iter()
                    .map(|user| scan.pool.get(user).map(|member| (user.clone(), member.intent.version)))
                    .collect()
            };

            match candidate.kind {
                CandidateKind::Individual => {
                    let Some(members) = members(&candidate.participants) else {
                        continue;
                    };
                    return Some(Proposal {
                        kind: MatchKind::Individual,
                        members,
                        scores: candidate.scores,
                        shared_segment: candidate.shared_segment.clone(),
                        transport_mode: candidate.transport_mode,
                        estimated_shared_minutes: candidate.estimated_shared_minutes,
                    });
                }
                CandidateKind::NewGroup { .. } => {
                    let Some(seed_prepared) = scan.pool.get(&seed.user_id) else {
                        continue;
                    };
                    let mut group = vec![seed_prepared];
                    group.extend(candidate.counterparts.iter().filter_map(|user| scan.pool.get(user)));
                    let Ok(mut evaluation) = self.generator.evaluate_group(&group, &ctx) else {
                        continue;
                    };

                    // Grow with the seed's other free candidates, best first.
                    for extra in set.candidates.iter().filter(free) {
                        let bounds = evaluation.group_bounds.unwrap_or_default();
                        if group.len() >= usize::from(bounds.max) {
                            break;
                        }
                        if !matches!(extra.kind, CandidateKind::NewGroup { .. }) {
                            continue;
                        }
                        for user in &extra.counterparts {
                            if group.iter().any(|member| member.intent.user_id == *user) {
                                continue;
                            }
                            let Some(member) = scan.pool.get(user) else {
                                continue;
                            };
                            group.push(member);
                            match self.generator.evaluate_group(&group, &ctx) {
                                Ok(grown) => evaluation = grown,
                                Err(_) => {
                                    group.pop();
                                }
                            }
                        }
                    }

                    let bounds: GroupSize = evaluation.group_bounds.unwrap_or_default();
                    if group.len() < usize::from(bounds.min) {
                        tracing::debug!(seed = %seed.user_id, size = group.len(), min = bounds.min, "group below minimum");
                        continue;
                    }
                    let users: Vec<UserId> = group.iter().map(|member| member.intent.user_id.clone()).collect();
                    let Some(members) = members(&users) else {
                        continue;
                    };
                    return Some(Proposal {
                        kind: MatchKind::Group {
                            min_size: bounds.min,
                            max_size: bounds.max,
                        },
                        members,
                        scores: evaluation.scores,
                        shared_segment: evaluation.shared_segment,
                        transport_mode: seed.transport_mode,
                        estimated_shared_minutes: evaluation.estimated_shared_minutes,
                    });
                }
                // Queue scans never offer existing groups.
                CandidateKind::JoinGroup { .. } => continue,
            }
        }
        None
    }

    /// Claim every member's intent, create the match with everyone
    /// accepted, then activate it.
    fn commit(&self, proposal: &Proposal) -> Result<(MatchId, Vec<UserId>, bool), EngineError> {
        let now = self.now();
        let participants: Vec<UserId> = proposal.members.keys().cloned().collect();
        let record = Match {
            id: MatchId::new(Uuid::new_v4().to_string()),
            kind: proposal.kind,
            participants: participants.clone(),
            decisions: participants
                .iter()
                .map(|user| {
                    (
                        user.clone(),
                        Decision {
                            accepted_at: Some(now),
                            ..Decision::default()
                        },
                    )
                })
                .collect(),
            scores: proposal.scores,
            shared_segment: proposal.shared_segment.clone(),
            transport_mode: proposal.transport_mode,
            estimated_shared_minutes: proposal.estimated_shared_minutes,
            status: MatchStatus::PartiallyAccepted,
            origin: MatchOrigin::Queue,
            chat_room_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let match_id = record.id.clone();
        let handle = self.store.with_intents(|intents| {
            for (user, version) in &proposal.members {
                match intents.get(user) {
                    Some(intent) if intent.is_queued() && intent.version == *version => {}
                    Some(_) => {
                        return Err(EngineError::ConcurrentAssignmentConflict(format!(
                            "commute of {} changed since the scan",
                            user
                        )));
                    }
                    None => {
                        return Err(EngineError::ConcurrentAssignmentConflict(format!(
                            "commute of {} was removed",
                            user
                        )));
                    }
                }
            }
            for user in proposal.members.keys() {
                if let Some(intent) = intents.get_mut(user) {
                    intent.status = IntentStatus::Matched;
                    intent.queueing = false;
                    intent.matched_by = Some(match_id.clone());
                    intent.version += 1;
                    intent.updated_at = now;
                }
            }
            Ok(self.store.insert_match(record))
        })?;

        let mut record = lock_match(&handle);
        tracing::info!(match_id = %record.id, participants = participants.len(), "queue assignment committed");
        let before = IndexKey::of(&record);
        let activated = self.activate(&mut record, now).is_ok() && record.status == MatchStatus::Active;
        record.touch(now);
        self.store.reindex(&before, &record);
        Ok((record.id.clone(), participants, activated))
    }
}

/// Runs the queue matcher and the sweep on a background thread.
pub struct QueueWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueWorker {
    pub fn spawn(engine: Arc<MatchingEngine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let interval = engine.config().queue.interval();

        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                if let Err(err) = engine.run_queue() {
                    tracing::warn!(error = %err, "queue run failed");
                }
                engine.sweep();
                thread::park_timeout(interval);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop after the current run and wait for the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("queue worker panicked");
            }
        }
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
