use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Messages received from a signaling client.
///
/// The wire format carries no discriminator: the kind is picked from which
/// fields are present, in the order offer, answer, candidate, end-call.
/// Payloads are opaque and forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Offer { call_id: String, offer: Value },
    Answer { call_id: String, answer: Value },
    Candidate { call_id: String, candidate: Value },
    EndCall { call_id: String },
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("message has no call_id")]
    MissingCallId,
    #[error("call_id must be a string")]
    InvalidCallId,
    #[error("message has no offer, answer, candidate or end_call marker")]
    UnrecognizedShape,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, MalformedMessage> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => Self::from_fields(fields),
            _ => Err(MalformedMessage::NotAnObject),
        }
    }

    fn from_fields(mut fields: Map<String, Value>) -> Result<Self, MalformedMessage> {
        let call_id = match fields.remove("call_id") {
            Some(Value::String(call_id)) => call_id,
            Some(_) => return Err(MalformedMessage::InvalidCallId),
            None => return Err(MalformedMessage::MissingCallId),
        };

        if let Some(offer) = fields.remove("offer") {
            return Ok(Self::Offer { call_id, offer });
        }
        if let Some(answer) = fields.remove("answer") {
            return Ok(Self::Answer { call_id, answer });
        }
        if let Some(candidate) = fields.remove("candidate") {
            return Ok(Self::Candidate { call_id, candidate });
        }
        if fields.get("type").and_then(Value::as_str) == Some("end_call") {
            return Ok(Self::EndCall { call_id });
        }
        Err(MalformedMessage::UnrecognizedShape)
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::Candidate { call_id, .. }
            | Self::EndCall { call_id } => call_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::EndCall { .. } => "end_call",
        }
    }
}

/// Messages pushed to a signaling client.
///
/// The identity message predates the typed notices and has no `type` field,
/// so the two shapes are kept apart and serialized untagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Welcome(Welcome),
    Notice(CallNotice),
}

/// Sent once, immediately after a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallNotice {
    /// An unanswered call is available to pick up
    NewCall { call_id: String, offer: Value },
    /// The caller's offer was accepted
    CallAnswered { call_id: String, answer: Value },
    /// Someone else answered the call
    CallTaken { call_id: String },
    /// Connectivity candidate from the other participant
    IceCandidate { call_id: String, candidate: Value },
    CallEnded { call_id: String },
}

impl ServerMessage {
    pub fn welcome(client_id: impl ToString) -> Self {
        Self::Welcome(Welcome {
            client_id: client_id.to_string(),
        })
    }

    pub fn new_call(call_id: &str, offer: Value) -> Self {
        Self::Notice(CallNotice::NewCall {
            call_id: call_id.to_string(),
            offer,
        })
    }

    pub fn call_answered(call_id: &str, answer: Value) -> Self {
        Self::Notice(CallNotice::CallAnswered {
            call_id: call_id.to_string(),
            answer,
        })
    }

    pub fn call_taken(call_id: &str) -> Self {
        Self::Notice(CallNotice::CallTaken {
            call_id: call_id.to_string(),
        })
    }

    pub fn ice_candidate(call_id: &str, candidate: Value) -> Self {
        Self::Notice(CallNotice::IceCandidate {
            call_id: call_id.to_string(),
            candidate,
        })
    }

    pub fn call_ended(call_id: &str) -> Self {
        Self::Notice(CallNotice::CallEnded {
            call_id: call_id.to_string(),
        })
    }
}
