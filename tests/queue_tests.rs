//! Queue engine tests
//!
//! Membership, assignment runs, group formation, activation retry and the
//! background worker.

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use commute_match::engine::MatchingEngine;
use commute_match::error::EngineError;
use commute_match::memory::{InMemoryProfiles, RecordingEvents};
use commute_match::model::{IntentStatus, MatchKind, MatchOrigin, MatchStatus, UserId, UserProfile};
use commute_match::traits::ProfileProvider;
use commute_match::{EngineConfig, QueueWorker};

use fixtures::*;

fn corridor_pair(h: &Harness) {
    h.add(
        profile("ana", "f", &["coffee", "hiking"]),
        TestCommute::along(DOWNTOWN_TO_BACK_BAY).window((7, 30), (8, 15)),
    );
    h.add(
        profile("ben", "m", &["coffee", "tech"]),
        TestCommute::along(COMMON_TO_BACK_BAY).window((7, 40), (8, 20)),
    );
}

fn ben_commute() -> TestCommute {
    TestCommute::along(COMMON_TO_BACK_BAY).window((7, 40), (8, 20))
}

/// Profiles that re-save Ben's commute whenever Ana's profile is fetched,
/// so each scan is stale by the time it commits.
struct ShiftingProfiles {
    inner: InMemoryProfiles,
    engine: OnceLock<Weak<MatchingEngine>>,
    shifts_left: AtomicUsize,
}

impl ProfileProvider for ShiftingProfiles {
    fn profile(&self, id: &UserId) -> Result<UserProfile, EngineError> {
        let shift = id.as_str() == "ana"
            && self
                .shifts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if shift {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                engine.upsert_commute(&user("ben"), ben_commute().input()).expect("re-save ben");
            }
        }
        self.inner.profile(id)
    }
}

fn shifting_engine(shifts: usize) -> Arc<MatchingEngine> {
    let profiles = Arc::new(ShiftingProfiles {
        inner: InMemoryProfiles::new(),
        engine: OnceLock::new(),
        shifts_left: AtomicUsize::new(0),
    });
    profiles.inner.insert(profile("ana", "f", &["coffee", "hiking"]));
    profiles.inner.insert(profile("ben", "m", &["coffee", "tech"]));

    let engine = Arc::new(
        MatchingEngine::new(
            EngineConfig::default(),
            profiles.clone(),
            Arc::new(FlakyChatRooms::default()),
            Arc::new(RecordingEvents::new()),
        )
        .expect("valid config"),
    );
    let _ = profiles.engine.set(Arc::downgrade(&engine));

    let ana = TestCommute::along(DOWNTOWN_TO_BACK_BAY).window((7, 30), (8, 15));
    engine.upsert_commute(&user("ana"), ana.input()).expect("ana");
    engine.upsert_commute(&user("ben"), ben_commute().input()).expect("ben");
    engine.join_queue(&user("ana")).expect("ana");
    engine.join_queue(&user("ben")).expect("ben");
    profiles.shifts_left.store(shifts, Ordering::SeqCst);
    engine
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn test_join_then_leave_leaves_nothing_behind() {
    let h = Harness::new();
    corridor_pair(&h);

    let joined = h.engine.join_queue(&user("ana")).expect("join");
    assert_eq!(joined.status, IntentStatus::Queued);
    assert!(joined.queueing);

    let left = h.engine.leave_queue(&user("ana")).expect("leave");
    assert_eq!(left.status, IntentStatus::Inactive);
    assert!(!left.queueing);

    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.queued, 0);
    assert!(report.matches_created.is_empty());
    assert_eq!(h.engine.store().match_count(), 0);
}

#[test]
fn test_join_and_leave_are_idempotent() {
    let h = Harness::new();
    corridor_pair(&h);

    let first = h.engine.join_queue(&user("ana")).expect("join");
    let second = h.engine.join_queue(&user("ana")).expect("join again");
    assert_eq!(first.version, second.version);

    let left = h.engine.leave_queue(&user("ana")).expect("leave");
    let again = h.engine.leave_queue(&user("ana")).expect("leave again");
    assert_eq!(left.version, again.version);
}

#[test]
fn test_join_without_commute() {
    let h = Harness::new();
    assert_eq!(h.engine.join_queue(&user("nobody")).unwrap_err().kind(), "not_found");
}

#[test]
fn test_upsert_keeps_queue_membership() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("join");

    let updated = h
        .engine
        .upsert_commute(&user("ana"), TestCommute::along(DOWNTOWN_TO_BACK_BAY).input())
        .expect("upsert");
    assert_eq!(updated.status, IntentStatus::Queued);
    assert!(updated.queueing);
}

// ============================================================================
// Assignment runs
// ============================================================================

#[test]
fn test_two_compatible_queued_commuters_become_one_active_match() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.queued, 2);
    assert_eq!(report.matches_created.len(), 1);
    assert_eq!(report.activated, report.matches_created);
    assert!(report.unmatched.is_empty());

    let record = h.engine.get_match(&report.matches_created[0]).expect("match");
    assert_eq!(record.status, MatchStatus::Active);
    assert_eq!(record.origin, MatchOrigin::Queue);
    assert_eq!(record.kind, MatchKind::Individual);
    assert_eq!(record.participants, vec![user("ana"), user("ben")]);
    assert_eq!(record.accepted_count(), 2);
    assert!(record.chat_room_id.is_some());
    assert_eq!(h.events.events().len(), 1);

    for id in ["ana", "ben"] {
        let intent = h.engine.intent(&user(id)).expect("intent");
        assert_eq!(intent.status, IntentStatus::Matched);
        assert!(!intent.queueing);
    }

    // Nothing left to do on the next run.
    let report = h.engine.run_queue().expect("second run");
    assert_eq!(report.queued, 0);
    assert_eq!(h.engine.store().match_count(), 1);
}

#[test]
fn test_matched_commuter_cannot_rejoin_queue() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");
    h.engine.run_queue().expect("run");

    let err = h.engine.join_queue(&user("ana")).unwrap_err();
    assert_eq!(err.kind(), "invalid_state_transition");
}

#[test]
fn test_incompatible_commuters_stay_queued() {
    let h = Harness::new();
    h.add(profile("ana", "f", &[]), TestCommute::along(DOWNTOWN_TO_BACK_BAY));
    h.add(profile("ben", "m", &[]), TestCommute::along(BACK_BAY_TO_DOWNTOWN));
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    let report = h.engine.run_queue().expect("run");
    assert!(report.matches_created.is_empty());
    assert_eq!(report.unmatched.len(), 2);
    assert_eq!(h.engine.intent(&user("ana")).expect("ana").status, IntentStatus::Queued);
}

#[test]
fn test_only_queued_commuters_are_assigned() {
    let h = Harness::new();
    corridor_pair(&h);
    h.add(
        profile("cleo", "f", &["coffee"]),
        TestCommute::along(COMMON_TO_BACK_BAY).window((7, 40), (8, 20)),
    );
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("cleo")).expect("cleo");

    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.matches_created.len(), 1);
    let record = h.engine.get_match(&report.matches_created[0]).expect("match");
    assert_eq!(record.participants, vec![user("ana"), user("cleo")]);
    assert_eq!(h.engine.intent(&user("ben")).expect("ben").status, IntentStatus::Inactive);
}

#[test]
fn test_each_commuter_assigned_once_per_run() {
    let h = Harness::new();
    h.add(profile("ana", "f", &[]), TestCommute::along(DOWNTOWN_TO_BACK_BAY));
    h.add(profile("ben", "m", &[]), TestCommute::along(COMMON_TO_BACK_BAY));
    h.add(profile("cleo", "f", &[]), TestCommute::along(COMMON_TO_BACK_BAY));
    for id in ["ana", "ben", "cleo"] {
        h.engine.join_queue(&user(id)).expect("join");
    }

    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.matches_created.len(), 1);
    assert_eq!(report.unmatched.len(), 1);

    let mut seen = Vec::new();
    for record in h.engine.store().matches_with_status(&[MatchStatus::Active]) {
        seen.extend(record.participants);
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 2);
}

#[test]
fn test_queue_forms_group_up_to_max() {
    let h = Harness::new();
    for id in ["ana", "ben", "cleo"] {
        h.add(profile(id, "f", &["coffee"]), TestCommute::along(COMMON_TO_BACK_BAY).group(3, 3));
        h.engine.join_queue(&user(id)).expect("join");
    }

    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.matches_created.len(), 1, "{:?}", report);

    let record = h.engine.get_match(&report.matches_created[0]).expect("group");
    assert_eq!(record.kind, MatchKind::Group { min_size: 3, max_size: 3 });
    assert_eq!(record.participants.len(), 3);
    assert_eq!(record.status, MatchStatus::Active);
}

#[test]
fn test_queue_group_waits_for_min_size() {
    let h = Harness::new();
    for id in ["ana", "ben"] {
        h.add(profile(id, "f", &[]), TestCommute::along(COMMON_TO_BACK_BAY).group(3, 4));
        h.engine.join_queue(&user(id)).expect("join");
    }

    let report = h.engine.run_queue().expect("run");
    assert!(report.matches_created.is_empty());
    assert_eq!(h.engine.intent(&user("ana")).expect("ana").status, IntentStatus::Queued);
}

#[test]
fn test_exhausted_budget_defers_seeds() {
    let mut config = EngineConfig::default();
    config.queue.run_budget_ms = 0;
    let h = Harness::with_config(config);
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    let report = h.engine.run_queue().expect("run");
    assert!(report.matches_created.is_empty());
    assert_eq!(report.deferred.len(), 2);
    assert_eq!(h.engine.intent(&user("ben")).expect("ben").status, IntentStatus::Queued);
}

#[test]
fn test_stale_scan_is_rescanned_once() {
    let engine = shifting_engine(1);

    let report = engine.run_queue().expect("run");
    assert_eq!(report.matches_created.len(), 1);
    assert!(report.conflicts.is_empty());
    let intent = engine.intent(&user("ben")).expect("ben");
    assert_eq!(intent.status, IntentStatus::Matched);
    assert_eq!(intent.matched_by.as_ref(), report.matches_created.first());
}

#[test]
fn test_repeated_conflict_is_reported_and_keeps_queue() {
    let engine = shifting_engine(usize::MAX);

    let report = engine.run_queue().expect("run");
    assert!(report.matches_created.is_empty());
    assert_eq!(report.conflicts.len(), 2);
    assert_eq!(engine.store().match_count(), 0);
    for id in ["ana", "ben"] {
        assert_eq!(engine.intent(&user(id)).expect(id).status, IntentStatus::Queued);
    }
}

// ============================================================================
// Activation failures
// ============================================================================

#[test]
fn test_failed_queue_activation_is_retried_next_run() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    h.chat.set_failing(true);
    let report = h.engine.run_queue().expect("run");
    assert_eq!(report.matches_created.len(), 1);
    assert_eq!(report.activation_failures, report.matches_created);
    let match_id = report.matches_created[0].clone();
    assert_eq!(h.engine.get_match(&match_id).expect("match").status, MatchStatus::PartiallyAccepted);
    // Claimed by the queue even without a room.
    assert_eq!(h.engine.intent(&user("ana")).expect("ana").status, IntentStatus::Matched);

    h.chat.set_failing(false);
    let report = h.engine.run_queue().expect("retry run");
    assert_eq!(report.activations_retried, vec![match_id.clone()]);
    assert_eq!(report.activated, vec![match_id.clone()]);
    assert_eq!(h.engine.get_match(&match_id).expect("match").status, MatchStatus::Active);
}

#[test]
fn test_expired_queue_match_gives_members_back() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    h.chat.set_failing(true);
    let match_id = h.engine.run_queue().expect("run").matches_created[0].clone();
    let err = h.engine.join_queue(&user("ana")).unwrap_err();
    assert_eq!(err.kind(), "invalid_state_transition");

    h.clock.advance(TimeDelta::hours(49));
    assert_eq!(h.engine.sweep().expired, vec![match_id.clone()]);

    for id in ["ana", "ben"] {
        let intent = h.engine.intent(&user(id)).expect(id);
        assert_eq!(intent.status, IntentStatus::Inactive);
        assert_eq!(intent.matched_by, None);
    }
    let rejoined = h.engine.join_queue(&user("ana")).expect("rejoin");
    assert_eq!(rejoined.status, IntentStatus::Queued);
}

#[test]
fn test_passing_stuck_queue_match_gives_members_back() {
    let h = Harness::new();
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    h.chat.set_failing(true);
    let match_id = h.engine.run_queue().expect("run").matches_created[0].clone();

    let record = h.engine.decline(&match_id, &user("ben")).expect("pass");
    assert_eq!(record.status, MatchStatus::Declined);
    for id in ["ana", "ben"] {
        assert_eq!(h.engine.intent(&user(id)).expect(id).status, IntentStatus::Inactive);
    }
    h.engine.join_queue(&user("ana")).expect("rejoin");

    h.chat.set_failing(false);
    let report = h.engine.run_queue().expect("retry run");
    assert!(report.activations_retried.is_empty());
}

// ============================================================================
// Background worker
// ============================================================================

#[test]
fn test_worker_assigns_in_background() {
    let mut config = EngineConfig::default();
    config.queue.interval_ms = 10;
    let h = Harness::with_config(config);
    corridor_pair(&h);
    h.engine.join_queue(&user("ana")).expect("ana");
    h.engine.join_queue(&user("ben")).expect("ben");

    let worker = QueueWorker::spawn(h.engine.clone());
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.engine.list_matches(&user("ana"), Some(MatchStatus::Active)).is_empty() {
        assert!(Instant::now() < deadline, "worker never assigned the pair");
        std::thread::sleep(Duration::from_millis(10));
    }
    worker.shutdown();

    assert_eq!(h.engine.store().match_count(), 1);
}
