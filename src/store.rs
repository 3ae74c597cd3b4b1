//! In-memory transactional store.
//!
//! Locking discipline:
//! - every match sits behind its own mutex, which serializes lifecycle
//!   operations on it;
//! - the intent table is one `RwLock`, and intents carry a version for
//!   optimistic commits;
//! - the match table, indexes, cooldowns and friends are leaf locks. They are
//!   never held while acquiring a match mutex.
//!
//! Lock order is match mutex → intent table → leaf locks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::model::{CommuteIntent, Match, MatchId, MatchStatus, UserId};

pub type MatchHandle = Arc<Mutex<Match>>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a single match. A poisoned mutex still holds a consistent match:
/// every mutation finishes before anything that can panic.
pub fn lock_match(handle: &MatchHandle) -> MutexGuard<'_, Match> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooldown key for an unordered pair of users.
pub fn pair_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// The indexed fields of a match before a mutation.
#[derive(Debug, Clone)]
pub struct IndexKey {
    status: MatchStatus,
    participants: Vec<UserId>,
}

impl IndexKey {
    pub fn of(record: &Match) -> Self {
        Self {
            status: record.status,
            participants: record.participants.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MatchStore {
    intents: RwLock<HashMap<UserId, CommuteIntent>>,
    matches: RwLock<HashMap<MatchId, MatchHandle>>,
    by_participant: RwLock<HashMap<UserId, BTreeSet<MatchId>>>,
    by_status: RwLock<HashMap<MatchStatus, BTreeSet<MatchId>>>,
    cooldowns: RwLock<HashMap<(UserId, UserId), DateTime<Utc>>>,
    friends: RwLock<HashMap<UserId, BTreeSet<UserId>>>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    pub fn intent(&self, user: &UserId) -> Option<CommuteIntent> {
        read(&self.intents).get(user).cloned()
    }

    /// All intents, ordered by intent id.
    pub fn intents_snapshot(&self) -> Vec<CommuteIntent> {
        let mut intents: Vec<CommuteIntent> = read(&self.intents).values().cloned().collect();
        intents.sort_by(|a, b| a.id.cmp(&b.id));
        intents
    }

    /// Run `update` with exclusive access to the intent table.
    pub fn with_intents<R>(&self, update: impl FnOnce(&mut HashMap<UserId, CommuteIntent>) -> R) -> R {
        let mut intents = write(&self.intents);
        update(&mut intents)
    }

    // ------------------------------------------------------------------
    // Matches
    // ------------------------------------------------------------------

    pub fn insert_match(&self, record: Match) -> MatchHandle {
        let id = record.id.clone();
        let status = record.status;
        let participants = record.participants.clone();
        let handle = Arc::new(Mutex::new(record));

        write(&self.matches).insert(id.clone(), Arc::clone(&handle));
        {
            let mut by_participant = write(&self.by_participant);
            for user in participants {
                by_participant.entry(user).or_default().insert(id.clone());
            }
        }
        write(&self.by_status).entry(status).or_default().insert(id);
        handle
    }

    pub fn handle(&self, id: &MatchId) -> Option<MatchHandle> {
        read(&self.matches).get(id).cloned()
    }

    pub fn get_match(&self, id: &MatchId) -> Option<Match> {
        let handle = self.handle(id)?;
        let record = lock_match(&handle).clone();
        Some(record)
    }

    /// Bring the indexes in line with `record` after a mutation that
    /// started from `before`.
    pub fn reindex(&self, before: &IndexKey, record: &Match) {
        if before.status != record.status {
            let mut by_status = write(&self.by_status);
            if let Some(ids) = by_status.get_mut(&before.status) {
                ids.remove(&record.id);
            }
            by_status.entry(record.status).or_default().insert(record.id.clone());
        }

        if before.participants != record.participants {
            let mut by_participant = write(&self.by_participant);
            // Users who left keep their index entry so they can still list
            // the match they declined.
            for user in &record.participants {
                by_participant.entry(user.clone()).or_default().insert(record.id.clone());
            }
        }
    }

    fn handles_for(&self, ids: impl IntoIterator<Item = MatchId>) -> Vec<MatchHandle> {
        let matches = read(&self.matches);
        ids.into_iter().filter_map(|id| matches.get(&id).cloned()).collect()
    }

    fn snapshots(handles: Vec<MatchHandle>) -> Vec<Match> {
        let mut records: Vec<Match> = handles.iter().map(|handle| lock_match(handle).clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Every match the user was ever part of, oldest first.
    pub fn matches_for(&self, user: &UserId) -> Vec<Match> {
        let ids: Vec<MatchId> = read(&self.by_participant)
            .get(user)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        Self::snapshots(self.handles_for(ids))
    }

    pub fn matches_with_status(&self, statuses: &[MatchStatus]) -> Vec<Match> {
        let ids: Vec<MatchId> = {
            let by_status = read(&self.by_status);
            statuses
                .iter()
                .filter_map(|status| by_status.get(status))
                .flatten()
                .cloned()
                .collect()
        };
        // A concurrent transition may have moved a match after the index read.
        Self::snapshots(self.handles_for(ids))
            .into_iter()
            .filter(|record| statuses.contains(&record.status))
            .collect()
    }

    pub fn remove_match(&self, id: &MatchId) -> Option<Match> {
        let handle = write(&self.matches).remove(id)?;
        let record = lock_match(&handle).clone();
        {
            let mut by_participant = write(&self.by_participant);
            for ids in by_participant.values_mut() {
                ids.remove(id);
            }
            by_participant.retain(|_, ids| !ids.is_empty());
        }
        if let Some(ids) = write(&self.by_status).get_mut(&record.status) {
            ids.remove(id);
        }
        Some(record)
    }

    pub fn match_count(&self) -> usize {
        read(&self.matches).len()
    }

    // ------------------------------------------------------------------
    // Cooldowns
    // ------------------------------------------------------------------

    /// Record a cooldown, keeping the later one if a pair already has one.
    pub fn set_cooldown(&self, a: &UserId, b: &UserId, until: DateTime<Utc>) {
        let mut cooldowns = write(&self.cooldowns);
        let entry = cooldowns.entry(pair_key(a, b)).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    pub fn cooldown_until(&self, a: &UserId, b: &UserId) -> Option<DateTime<Utc>> {
        read(&self.cooldowns).get(&pair_key(a, b)).copied()
    }

    /// Cooldowns still in force at `now`.
    pub fn active_cooldowns(&self, now: DateTime<Utc>) -> HashMap<(UserId, UserId), DateTime<Utc>> {
        read(&self.cooldowns)
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(pair, until)| (pair.clone(), *until))
            .collect()
    }

    pub fn purge_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let mut cooldowns = write(&self.cooldowns);
        let before = cooldowns.len();
        cooldowns.retain(|_, until| *until > now);
        before - cooldowns.len()
    }

    // ------------------------------------------------------------------
    // Friends
    // ------------------------------------------------------------------

    pub fn add_friends<'a>(&self, user: &UserId, others: impl IntoIterator<Item = &'a UserId>) {
        let mut friends = write(&self.friends);
        let entry = friends.entry(user.clone()).or_default();
        for other in others {
            if other != user {
                entry.insert(other.clone());
            }
        }
    }

    pub fn friends(&self, user: &UserId) -> BTreeSet<UserId> {
        read(&self.friends).get(user).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeDelta;

    use super::*;
    use crate::model::{MatchKind, MatchOrigin, TransportMode};
    use crate::scoring::CompatibilityScore;

    fn sample_match(id: &str, users: &[&str], now: DateTime<Utc>) -> Match {
        Match {
            id: MatchId::new(id),
            kind: MatchKind::Individual,
            participants: users.iter().map(|user| UserId::new(*user)).collect(),
            decisions: BTreeMap::new(),
            scores: CompatibilityScore::default(),
            shared_segment: None,
            transport_mode: TransportMode::Walk,
            estimated_shared_minutes: 0,
            status: MatchStatus::Suggested,
            origin: MatchOrigin::OnDemand,
            chat_room_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_indexes_follow_status_changes() {
        let store = MatchStore::new();
        let now = Utc::now();
        let handle = store.insert_match(sample_match("m1", &["a", "b"], now));

        assert_eq!(store.matches_for(&UserId::new("a")).len(), 1);
        assert_eq!(store.matches_with_status(&[MatchStatus::Suggested]).len(), 1);

        {
            let mut record = lock_match(&handle);
            let before = IndexKey::of(&record);
            record.status = MatchStatus::Active;
            store.reindex(&before, &record);
        }

        assert!(store.matches_with_status(&[MatchStatus::Suggested]).is_empty());
        assert_eq!(store.matches_with_status(&[MatchStatus::Active]).len(), 1);
    }

    #[test]
    fn test_remove_match_clears_indexes() {
        let store = MatchStore::new();
        store.insert_match(sample_match("m1", &["a", "b"], Utc::now()));
        assert!(store.remove_match(&MatchId::new("m1")).is_some());
        assert!(store.matches_for(&UserId::new("a")).is_empty());
        assert_eq!(store.match_count(), 0);
    }

    #[test]
    fn test_cooldown_is_unordered_and_keeps_latest() {
        let store = MatchStore::new();
        let now = Utc::now();
        let a = UserId::new("a");
        let b = UserId::new("b");
        store.set_cooldown(&a, &b, now + TimeDelta::hours(24));
        store.set_cooldown(&b, &a, now + TimeDelta::hours(1));
        assert_eq!(store.cooldown_until(&b, &a), Some(now + TimeDelta::hours(24)));
        assert_eq!(store.active_cooldowns(now).len(), 1);
        assert_eq!(store.purge_cooldowns(now + TimeDelta::hours(25)), 1);
    }

    #[test]
    fn test_friends_skip_self() {
        let store = MatchStore::new();
        let a = UserId::new("a");
        let b = UserId::new("b");
        store.add_friends(&a, [&a, &b]);
        assert_eq!(store.friends(&a).into_iter().collect::<Vec<_>>(), vec![b]);
    }
}
