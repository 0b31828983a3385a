//! Candidate routing between the two participants of a call.
//!
//! Every candidate is buffered in the store whether or not it can be
//! forwarded. A late answerer receives the caller's backlog once, right
//! when its answer is accepted.

use serde_json::Value;
use tracing::debug;

use crate::calls::{AcceptOutcome, CallError, CallStore};
use crate::protocol::ServerMessage;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Buffer `candidate` and forward it to the counterpart if one is known.
pub fn relay_candidate(
    calls: &CallStore,
    registry: &ConnectionRegistry,
    call_id: &str,
    from: ConnectionId,
    candidate: Value,
) -> Result<Option<ConnectionId>, CallError> {
    calls.append_candidate(call_id, from, candidate, |peer, candidate| {
        if registry.is_live(peer) {
            registry.send(peer, ServerMessage::ice_candidate(call_id, candidate.clone()));
        } else {
            debug!(call_id, peer = %peer, "peer gone, candidate kept in buffer only");
        }
    })
}

/// Accept an answer and flush the caller's buffered candidates to the new
/// answerer, one message per candidate, in their original order.
pub fn accept_and_flush(
    calls: &CallStore,
    registry: &ConnectionRegistry,
    call_id: &str,
    answerer: ConnectionId,
    answer: Value,
) -> Result<AcceptOutcome, CallError> {
    let mut flushed = 0usize;
    let outcome = calls.accept_answer_while(
        call_id,
        answerer,
        answer,
        |id| registry.is_live(id),
        |candidate| {
            if registry.send(answerer, ServerMessage::ice_candidate(call_id, candidate.clone())) {
                flushed += 1;
            }
        },
    )?;
    if flushed > 0 {
        debug!(call_id, answerer = %answerer, flushed, "flushed caller candidates");
    }
    Ok(outcome)
}
