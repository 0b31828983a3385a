use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::registry::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("call {0} already exists")]
    DuplicateCall(String),
    #[error("call {0} does not exist")]
    UnknownCall(String),
    #[error("connection {connection} is not a participant of call {call_id}")]
    NotAParticipant {
        call_id: String,
        connection: ConnectionId,
    },
    #[error("connection {0} is no longer connected")]
    Disconnected(ConnectionId),
}

impl CallError {
    /// Short label used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            CallError::DuplicateCall(_) => "duplicate_call",
            CallError::UnknownCall(_) => "unknown_call",
            CallError::NotAParticipant { .. } => "not_a_participant",
            CallError::Disconnected(_) => "disconnected",
        }
    }
}

/// Answer side of a call. Kept as one value so a call is either answered
/// with both fields or not answered at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Answered {
    pub answerer: ConnectionId,
    pub answer: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub caller: ConnectionId,
    pub offer: Value,
    pub answered: Option<Answered>,
    pub created_at: Instant,
    pub caller_candidates: Vec<Value>,
    pub answerer_candidates: Vec<Value>,
}

impl CallSession {
    fn new(caller: ConnectionId, offer: Value, created_at: Instant) -> Self {
        Self {
            caller,
            offer,
            answered: None,
            created_at,
            caller_candidates: Vec::new(),
            answerer_candidates: Vec::new(),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answered.is_some()
    }

    pub fn answerer(&self) -> Option<ConnectionId> {
        self.answered.as_ref().map(|answered| answered.answerer)
    }

    pub fn involves(&self, connection: ConnectionId) -> bool {
        self.caller == connection || self.answerer() == Some(connection)
    }

    pub fn participants(&self) -> Participants {
        Participants {
            caller: self.caller,
            answerer: self.answerer(),
        }
    }

    /// Unanswered and older than `ttl`. Answered calls never expire.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        !self.is_answered() && now.saturating_duration_since(self.created_at) > ttl
    }
}

/// The connections taking part in a call at the moment it was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub caller: ConnectionId,
    pub answerer: Option<ConnectionId>,
}

impl Participants {
    /// Distinct participant identities, caller first.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> {
        let caller = self.caller;
        std::iter::once(caller).chain(self.answerer.filter(|answerer| *answerer != caller))
    }

    /// The participant on the other side of `connection`, if any.
    pub fn peer_of(&self, connection: ConnectionId) -> Option<ConnectionId> {
        self.iter().find(|id| *id != connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted { caller: ConnectionId },
    /// Another answer got there first. Not an error: concurrent answerers
    /// race and exactly one wins.
    AlreadyAnswered,
}

/// A call torn down because one of its participants went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedCall {
    pub call_id: String,
    pub survivor: Option<ConnectionId>,
}

/// A call reclaimed by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredCall {
    pub call_id: String,
    pub participants: Participants,
}

/// Authoritative record of every live call attempt, keyed by call id.
///
/// Each operation does its check and its mutation under the entry's shard
/// lock, so concurrent operations on one call id never interleave.
pub struct CallStore {
    calls: DashMap<String, CallSession>,
}

impl CallStore {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn get(&self, call_id: &str) -> Option<CallSession> {
        self.calls.get(call_id).map(|call| call.value().clone())
    }

    pub fn create_offer(
        &self,
        call_id: &str,
        caller: ConnectionId,
        offer: Value,
    ) -> Result<(), CallError> {
        self.create_offer_at(call_id, caller, offer, Instant::now())
    }

    pub fn create_offer_at(
        &self,
        call_id: &str,
        caller: ConnectionId,
        offer: Value,
        now: Instant,
    ) -> Result<(), CallError> {
        self.create_offer_while(call_id, caller, offer, now, |_| true)
    }

    /// Create the call only if `is_live(caller)` holds. The check runs under
    /// the entry lock, so a disconnect that unregisters the caller either
    /// refuses the offer here or finds the new call in its cleanup.
    pub fn create_offer_while<L>(
        &self,
        call_id: &str,
        caller: ConnectionId,
        offer: Value,
        now: Instant,
        is_live: L,
    ) -> Result<(), CallError>
    where
        L: FnOnce(ConnectionId) -> bool,
    {
        match self.calls.entry(call_id.to_string()) {
            Entry::Occupied(_) => Err(CallError::DuplicateCall(call_id.to_string())),
            Entry::Vacant(_) if !is_live(caller) => Err(CallError::Disconnected(caller)),
            Entry::Vacant(slot) => {
                slot.insert(CallSession::new(caller, offer, now));
                Ok(())
            }
        }
    }

    /// Record `answerer` as the one who accepted the call. First answer wins.
    ///
    /// On success `flush` is called with every buffered caller candidate, in
    /// append order, while the call is still locked: a candidate appended
    /// concurrently is either part of that backlog or forwarded after it,
    /// never both and never ahead of it.
    pub fn accept_answer<F>(
        &self,
        call_id: &str,
        answerer: ConnectionId,
        answer: Value,
        flush: F,
    ) -> Result<AcceptOutcome, CallError>
    where
        F: FnMut(&Value),
    {
        self.accept_answer_while(call_id, answerer, answer, |_| true, flush)
    }

    /// [`accept_answer`](Self::accept_answer), refused with
    /// [`CallError::Disconnected`] unless `is_live(answerer)` holds while the
    /// call is locked. An answered call never expires, so a vanished
    /// answerer must never be recorded.
    pub fn accept_answer_while<L, F>(
        &self,
        call_id: &str,
        answerer: ConnectionId,
        answer: Value,
        is_live: L,
        mut flush: F,
    ) -> Result<AcceptOutcome, CallError>
    where
        L: FnOnce(ConnectionId) -> bool,
        F: FnMut(&Value),
    {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;

        if call.is_answered() {
            return Ok(AcceptOutcome::AlreadyAnswered);
        }
        if !is_live(answerer) {
            return Err(CallError::Disconnected(answerer));
        }

        call.answered = Some(Answered { answerer, answer });
        for candidate in &call.caller_candidates {
            flush(candidate);
        }

        Ok(AcceptOutcome::Accepted {
            caller: call.caller,
        })
    }

    /// Append `candidate` to the sender's side of the call.
    ///
    /// Returns the peer's identity, or `None` while nobody has answered yet
    /// (the candidate is then only buffered). `forward` runs with the peer
    /// while the call is locked.
    pub fn append_candidate<F>(
        &self,
        call_id: &str,
        from: ConnectionId,
        candidate: Value,
        forward: F,
    ) -> Result<Option<ConnectionId>, CallError>
    where
        F: FnOnce(ConnectionId, &Value),
    {
        let mut entry = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        let call = &mut *entry;

        let answerer = call.answerer();
        let (buffer, peer) = if from == call.caller {
            (&mut call.caller_candidates, answerer)
        } else if answerer == Some(from) {
            (&mut call.answerer_candidates, Some(call.caller))
        } else {
            return Err(CallError::NotAParticipant {
                call_id: call_id.to_string(),
                connection: from,
            });
        };

        buffer.push(candidate);
        if let (Some(peer), Some(candidate)) = (peer, buffer.last()) {
            forward(peer, candidate);
        }

        Ok(peer)
    }

    /// Remove the call if present. Returns who was in it.
    pub fn end(&self, call_id: &str) -> Option<Participants> {
        self.calls
            .remove(call_id)
            .map(|(_, call)| call.participants())
    }

    /// Remove every call `connection` takes part in, reporting the other
    /// participant of each so it can be told the call is over.
    pub fn remove_if_participant(&self, connection: ConnectionId) -> Vec<EndedCall> {
        let candidates: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.value().involves(connection))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|call_id| {
                self.calls
                    .remove_if(&call_id, |_, call| call.involves(connection))
            })
            .map(|(call_id, call)| EndedCall {
                call_id,
                survivor: call.participants().peer_of(connection),
            })
            .collect()
    }

    /// Remove and return every unanswered call older than `ttl`.
    pub fn sweep_expired(&self, now: Instant, ttl: Duration) -> Vec<ExpiredCall> {
        let candidates: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.value().is_expired(now, ttl))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|call_id| {
                self.calls
                    .remove_if(&call_id, |_, call| call.is_expired(now, ttl))
            })
            .map(|(call_id, call)| ExpiredCall {
                call_id,
                participants: call.participants(),
            })
            .collect()
    }

    /// Unanswered, unexpired calls in creation order, for announcing to a
    /// newly connected client.
    pub fn pending_offers(&self, now: Instant, ttl: Duration) -> Vec<(String, Value)> {
        let mut pending: Vec<(Instant, String, Value)> = self
            .calls
            .iter()
            .filter(|entry| {
                let call = entry.value();
                !call.is_answered() && !call.is_expired(now, ttl)
            })
            .map(|entry| {
                let call = entry.value();
                (call.created_at, entry.key().clone(), call.offer.clone())
            })
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        pending
            .into_iter()
            .map(|(_, call_id, offer)| (call_id, offer))
            .collect()
    }
}

impl Default for CallStore {
    fn default() -> Self {
        Self::new()
    }
}
