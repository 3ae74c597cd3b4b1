//! Match state machine.
//!
//! ```text
//! suggested -> partially_accepted -> active -> completed
//!      \               \                \
//!       +---------------+----------------+--> declined / expired
//! ```
//!
//! Every operation locks the match for its whole duration, so two racing
//! accepts are serialized and only one of them can activate the match.

use chrono::{DateTime, Utc};

use crate::engine::MatchingEngine;
use crate::error::EngineError;
use crate::events::MatchEvent;
use crate::icebreaker::icebreaker;
use crate::model::{IntentStatus, Match, MatchId, MatchKind, MatchStatus, UserId};
use crate::scoring::shared_interests;
use crate::store::{IndexKey, lock_match};

fn transition_error(record: &Match, action: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        match_id: record.id.clone(),
        status: record.status,
        action,
    }
}

impl MatchingEngine {
    /// Record `user`'s acceptance, activating the match once enough
    /// participants have accepted.
    ///
    /// Fails with `InvalidStateTransition` while `user`'s commute is held by
    /// another match. If the chat service fails during activation the
    /// acceptance is kept, the match stays `partially_accepted` and the
    /// error is returned; see [`MatchingEngine::retry_activation`].
    #[tracing::instrument(skip(self), fields(match_id = %match_id, user = %user))]
    pub fn accept(&self, match_id: &MatchId, user: &UserId) -> Result<Match, EngineError> {
        let handle = self
            .store
            .handle(match_id)
            .ok_or_else(|| EngineError::not_found("match", match_id))?;
        let mut record = lock_match(&handle);
        let now = self.now();

        if record.status.is_terminal() || record.has_declined(user) {
            return Err(transition_error(&record, "accept"));
        }
        if !record.is_participant(user) {
            return Err(EngineError::not_found("match participant", user));
        }
        if record.has_accepted(user) {
            return Err(transition_error(&record, "accept"));
        }
        if record.status == MatchStatus::Active && !record.kind.is_group() {
            return Err(transition_error(&record, "accept"));
        }
        if self.held_elsewhere(user, &record.id) {
            tracing::debug!("commute already held by another match");
            return Err(transition_error(&record, "accept"));
        }

        let before = IndexKey::of(&record);
        if record.status == MatchStatus::Active {
            // Claimed before the acceptance is recorded so a lost race leaves
            // no trace.
            if self.claim_intents(&record.id, std::slice::from_ref(user), now).is_err() {
                return Err(transition_error(&record, "accept"));
            }
        }
        record.decisions.entry(user.clone()).or_default().accepted_at = Some(now);

        let outcome = if record.status == MatchStatus::Active {
            self.join_active_group(&mut record, user);
            Ok(())
        } else if record.accepted_count() >= record.kind.activation_threshold() {
            self.activate(&mut record, now)
        } else {
            record.status = MatchStatus::PartiallyAccepted;
            tracing::info!(accepted = record.accepted_count(), "match partially accepted");
            Ok(())
        };

        record.touch(now);
        self.store.reindex(&before, &record);
        outcome.map(|()| record.clone())
    }

    /// Decline ("pass") a match.
    ///
    /// A 1:1 match is declined outright. A group loses the decliner and is
    /// declined only when too few participants remain. Either way the
    /// decliner gets a cooldown against everyone else in the match.
    #[tracing::instrument(skip(self), fields(match_id = %match_id, user = %user))]
    pub fn decline(&self, match_id: &MatchId, user: &UserId) -> Result<Match, EngineError> {
        let handle = self
            .store
            .handle(match_id)
            .ok_or_else(|| EngineError::not_found("match", match_id))?;
        let mut record = lock_match(&handle);
        let now = self.now();

        if record.status.is_terminal() || record.has_declined(user) {
            return Err(transition_error(&record, "pass"));
        }
        if !record.is_participant(user) {
            return Err(EngineError::not_found("match participant", user));
        }
        // Members of a running match leave through a review instead.
        if record.status == MatchStatus::Active && record.has_accepted(user) {
            return Err(transition_error(&record, "pass"));
        }

        let before = IndexKey::of(&record);
        let cooldown_until = now + self.config.lifecycle.decline_cooldown();
        let others: Vec<UserId> = record.others(user).cloned().collect();

        {
            let decision = record.decisions.entry(user.clone()).or_default();
            decision.declined_at = Some(now);
            decision.accepted_at = None;
            decision.cooldown_until = Some(cooldown_until);
        }
        for other in &others {
            self.store.set_cooldown(user, other, cooldown_until);
        }

        match record.kind {
            MatchKind::Individual => {
                record.status = MatchStatus::Declined;
            }
            MatchKind::Group { min_size, .. } => {
                record.remove_participant(user);
                if record.participants.len() < usize::from(min_size) {
                    record.status = MatchStatus::Declined;
                }
            }
        }
        // A queue match stuck without a room already holds its members.
        self.release_intents(&record.id, std::slice::from_ref(user), now);
        if record.status.is_terminal() {
            self.release_intents(&record.id, &record.participants, now);
        }

        record.touch(now);
        self.store.reindex(&before, &record);
        tracing::info!(status = %record.status, remaining = record.participants.len(), "match passed");
        Ok(record.clone())
    }

    /// Close an active match with the reviewer's verdict.
    ///
    /// A positive review adds the other participants to the reviewer's
    /// commute friends and completes the match; a negative one declines it
    /// and starts a cooldown. The commutes the match holds are released.
    #[tracing::instrument(skip(self), fields(match_id = %match_id, user = %user))]
    pub fn review(&self, match_id: &MatchId, user: &UserId, enjoyed: bool) -> Result<Match, EngineError> {
        let handle = self
            .store
            .handle(match_id)
            .ok_or_else(|| EngineError::not_found("match", match_id))?;
        let mut record = lock_match(&handle);
        let now = self.now();

        if record.status != MatchStatus::Active || !record.has_accepted(user) {
            return Err(transition_error(&record, "review"));
        }

        let before = IndexKey::of(&record);
        let others: Vec<UserId> = record.others(user).cloned().collect();

        if enjoyed {
            self.store.add_friends(user, &others);
            record.status = MatchStatus::Completed;
        } else {
            let cooldown_until = now + self.config.lifecycle.decline_cooldown();
            for other in &others {
                self.store.set_cooldown(user, other, cooldown_until);
            }
            if let Some(decision) = record.decisions.get_mut(user) {
                decision.cooldown_until = Some(cooldown_until);
            }
            record.status = MatchStatus::Declined;
        }

        self.release_intents(&record.id, &record.participants, now);
        record.touch(now);
        self.store.reindex(&before, &record);
        tracing::info!(enjoyed, status = %record.status, "match reviewed");
        Ok(record.clone())
    }

    /// Retry activation of a match whose acceptances are complete but whose
    /// chat room could not be created.
    #[tracing::instrument(skip(self), fields(match_id = %match_id))]
    pub fn retry_activation(&self, match_id: &MatchId) -> Result<Match, EngineError> {
        let handle = self
            .store
            .handle(match_id)
            .ok_or_else(|| EngineError::not_found("match", match_id))?;
        let mut record = lock_match(&handle);

        if record.status != MatchStatus::PartiallyAccepted
            || record.accepted_count() < record.kind.activation_threshold()
        {
            return Err(transition_error(&record, "activate"));
        }

        let now = self.now();
        let before = IndexKey::of(&record);
        let outcome = self.activate(&mut record, now);
        record.touch(now);
        self.store.reindex(&before, &record);
        outcome.map(|()| record.clone())
    }

    /// Claim the accepted participants, create the chat room, mark the
    /// match active and announce it.
    ///
    /// Acceptances from users another match has claimed in the meantime are
    /// withdrawn; if too few remain the match stays `partially_accepted`
    /// and `Ok` is returned. A chat failure gives the claims back and
    /// leaves the match `partially_accepted` without a room. Callers hold
    /// the match lock and reindex afterwards.
    pub(crate) fn activate(&self, record: &mut Match, now: DateTime<Utc>) -> Result<(), EngineError> {
        let (accepted, previous) = loop {
            let accepted: Vec<UserId> = record
                .participants
                .iter()
                .filter(|user| record.has_accepted(user))
                .cloned()
                .collect();
            match self.claim_intents(&record.id, &accepted, now) {
                Ok(previous) => break (accepted, previous),
                Err(taken) => {
                    for user in &taken {
                        if let Some(decision) = record.decisions.get_mut(user) {
                            decision.accepted_at = None;
                        }
                    }
                    record.status = MatchStatus::PartiallyAccepted;
                    tracing::info!(match_id = %record.id, withdrawn = taken.len(), "acceptances withdrawn, matched elsewhere");
                    if record.accepted_count() < record.kind.activation_threshold() {
                        return Ok(());
                    }
                }
            }
        };

        let room = match self.chat.create_room(&record.id, &accepted) {
            Ok(room) => room,
            Err(err) => {
                self.restore_intents(&record.id, &previous, now);
                record.status = MatchStatus::PartiallyAccepted;
                tracing::warn!(match_id = %record.id, error = %err, "activation failed, match stays partially accepted");
                return Err(err);
            }
        };

        record.status = MatchStatus::Active;
        record.chat_room_id = Some(room.clone());

        let text = self.icebreaker_for(record, &accepted);
        self.events.publish(MatchEvent::Activated {
            match_id: record.id.clone(),
            chat_room_id: room.clone(),
            participant_ids: accepted.clone(),
            icebreaker_text: text,
        });
        tracing::info!(match_id = %record.id, room = %room, participants = accepted.len(), "match activated");
        Ok(())
    }

    fn join_active_group(&self, record: &mut Match, user: &UserId) {
        if let Some(room) = record.chat_room_id.clone() {
            self.events.publish(MatchEvent::MemberJoined {
                match_id: record.id.clone(),
                chat_room_id: room,
                user_id: user.clone(),
            });
        }
        tracing::info!(match_id = %record.id, "member joined active group");
    }

    fn icebreaker_for(&self, record: &Match, participants: &[UserId]) -> String {
        let meet = record
            .shared_segment
            .as_ref()
            .and_then(|shared| shared.meet_name.as_deref());
        // A missing profile only costs the interest-based opener.
        let interests = match self.load_profiles(participants) {
            Ok(profiles) if profiles.len() == participants.len() => {
                let sets: Vec<_> = participants
                    .iter()
                    .filter_map(|user| profiles.get(user))
                    .map(|profile| &profile.interests)
                    .collect();
                shared_interests(&sets)
            }
            Ok(_) => Default::default(),
            Err(err) => {
                tracing::warn!(match_id = %record.id, error = %err, "profiles unavailable for icebreaker");
                Default::default()
            }
        };
        icebreaker(&interests, meet)
    }

    /// Whether `user`'s commute is held by a match other than `match_id`.
    fn held_elsewhere(&self, user: &UserId, match_id: &MatchId) -> bool {
        self.store.intent(user).is_some_and(|intent| {
            intent.status == IntentStatus::Matched && intent.matched_by.as_ref() != Some(match_id)
        })
    }

    /// Take users out of the pool for `match_id`: their intents become
    /// `matched` and leave the queue. All or nothing: if any of them is
    /// held by another match, nothing is claimed and those users are
    /// returned. On success each user's prior status and queue flag are
    /// returned for [`Self::restore_intents`].
    pub(crate) fn claim_intents(
        &self,
        match_id: &MatchId,
        users: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<Vec<(UserId, IntentStatus, bool)>, Vec<UserId>> {
        self.store.with_intents(|intents| {
            let taken: Vec<UserId> = users
                .iter()
                .filter(|user| {
                    intents.get(*user).is_some_and(|intent| {
                        intent.status == IntentStatus::Matched && intent.matched_by.as_ref() != Some(match_id)
                    })
                })
                .cloned()
                .collect();
            if !taken.is_empty() {
                return Err(taken);
            }

            let mut previous = Vec::with_capacity(users.len());
            for user in users {
                let Some(intent) = intents.get_mut(user) else {
                    continue;
                };
                previous.push((user.clone(), intent.status, intent.queueing));
                if intent.matched_by.as_ref() != Some(match_id) {
                    intent.status = IntentStatus::Matched;
                    intent.queueing = false;
                    intent.matched_by = Some(match_id.clone());
                    intent.version += 1;
                    intent.updated_at = now;
                }
            }
            Ok(previous)
        })
    }

    /// Undo a claim made by a failed activation. Users this match already
    /// held before the attempt stay held.
    fn restore_intents(&self, match_id: &MatchId, previous: &[(UserId, IntentStatus, bool)], now: DateTime<Utc>) {
        self.store.with_intents(|intents| {
            for (user, status, queueing) in previous {
                if *status == IntentStatus::Matched {
                    continue;
                }
                if let Some(intent) = intents.get_mut(user) {
                    if intent.matched_by.as_ref() == Some(match_id) {
                        intent.status = *status;
                        intent.queueing = *queueing;
                        intent.matched_by = None;
                        intent.version += 1;
                        intent.updated_at = now;
                    }
                }
            }
        });
    }

    /// Give back the commutes `match_id` holds among `users`. Commutes held
    /// by another match are left alone.
    pub(crate) fn release_intents(&self, match_id: &MatchId, users: &[UserId], now: DateTime<Utc>) {
        self.store.with_intents(|intents| {
            for user in users {
                if let Some(intent) = intents.get_mut(user) {
                    if intent.matched_by.as_ref() == Some(match_id) {
                        intent.status = IntentStatus::Inactive;
                        intent.matched_by = None;
                        intent.version += 1;
                        intent.updated_at = now;
                    }
                }
            }
        });
    }
}
