//! HTTP polling binding over the same coordinator logic.
//!
//! A polling client gets a mailbox in place of a socket: everything the
//! coordinator would push is queued there until the client fetches it.
//! Clients that stop polling are disconnected by the reaper, which is the
//! polling equivalent of a closed channel.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::coordinator::SharedCoordinator;
use crate::protocol::{ServerMessage, Welcome};
use crate::registry::ConnectionId;

struct Mailbox {
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    last_seen: Instant,
}

#[derive(Clone)]
pub struct PollingState {
    coordinator: SharedCoordinator,
    mailboxes: Arc<DashMap<ConnectionId, Mailbox>>,
    idle_timeout: Duration,
}

impl PollingState {
    pub fn new(coordinator: SharedCoordinator, idle_timeout: Duration) -> Self {
        Self {
            coordinator,
            mailboxes: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    pub fn coordinator(&self) -> &SharedCoordinator {
        &self.coordinator
    }

    pub fn client_count(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn connect(&self) -> ConnectionId {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.coordinator.connect(tx);
        self.mailboxes.insert(
            connection,
            Mailbox {
                inbox: rx,
                last_seen: Instant::now(),
            },
        );
        connection
    }

    /// Take everything queued for `connection`, oldest first. `None` if the
    /// client is unknown.
    pub fn drain(&self, connection: ConnectionId) -> Option<Vec<ServerMessage>> {
        let mut mailbox = self.mailboxes.get_mut(&connection)?;
        mailbox.last_seen = Instant::now();
        let mut messages = Vec::new();
        while let Ok(message) = mailbox.inbox.try_recv() {
            messages.push(message);
        }
        Some(messages)
    }

    /// Feed one inbound frame to the coordinator. Returns false if the client
    /// is unknown.
    pub fn submit(&self, connection: ConnectionId, text: &str) -> bool {
        match self.mailboxes.get_mut(&connection) {
            Some(mut mailbox) => mailbox.last_seen = Instant::now(),
            None => return false,
        }
        self.coordinator.handle_text(connection, text);
        true
    }

    /// Returns true if the client was still connected.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        let removed = self.mailboxes.remove(&connection).is_some();
        self.coordinator.disconnect(connection);
        removed
    }

    /// Disconnect every client that has not been heard from within the idle
    /// timeout.
    pub fn reap_idle(&self, now: Instant) -> Vec<ConnectionId> {
        let idle: Vec<ConnectionId> = self
            .mailboxes
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        idle.into_iter()
            .filter(|connection| self.reap_if_idle(*connection, now))
            .collect()
    }

    /// Idleness is checked again under the mailbox lock, so a client that
    /// polled after the scan is left alone.
    fn reap_if_idle(&self, connection: ConnectionId, now: Instant) -> bool {
        let removed = self
            .mailboxes
            .remove_if(&connection, |_, mailbox| {
                now.saturating_duration_since(mailbox.last_seen) > self.idle_timeout
            })
            .is_some();
        if removed {
            info!(connection = %connection, "polling client idle, disconnecting");
            self.coordinator.disconnect(connection);
        }
        removed
    }
}

pub fn spawn_reaper(state: PollingState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let reaped = state.reap_idle(Instant::now());
            if !reaped.is_empty() {
                debug!(reaped = reaped.len(), "reaped idle polling clients");
            }
        }
    })
}

pub fn router(state: PollingState) -> Router {
    Router::new()
        .route("/poll/connect", post(connect_client))
        .route(
            "/poll/:client_id/messages",
            get(poll_messages).post(submit_message),
        )
        .route("/poll/:client_id", delete(disconnect_client))
        .with_state(state)
}

#[derive(Debug)]
pub enum PollError {
    InvalidClientId,
    UnknownClient,
}

#[derive(Debug, Serialize)]
struct PollErrorBody {
    error: &'static str,
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            PollError::InvalidClientId => (StatusCode::BAD_REQUEST, "invalid_client_id"),
            PollError::UnknownClient => (StatusCode::NOT_FOUND, "unknown_client"),
        };
        (status, Json(PollErrorBody { error })).into_response()
    }
}

fn parse_client_id(raw: &str) -> Result<ConnectionId, PollError> {
    raw.parse().map_err(|_| PollError::InvalidClientId)
}

async fn connect_client(State(state): State<PollingState>) -> Json<Welcome> {
    let connection = state.connect();
    Json(Welcome {
        client_id: connection.to_string(),
    })
}

async fn poll_messages(
    State(state): State<PollingState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<ServerMessage>>, PollError> {
    let connection = parse_client_id(&client_id)?;
    state
        .drain(connection)
        .map(Json)
        .ok_or(PollError::UnknownClient)
}

async fn submit_message(
    State(state): State<PollingState>,
    Path(client_id): Path<String>,
    body: String,
) -> Result<StatusCode, PollError> {
    let connection = parse_client_id(&client_id)?;
    if state.submit(connection, &body) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(PollError::UnknownClient)
    }
}

async fn disconnect_client(
    State(state): State<PollingState>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, PollError> {
    let connection = parse_client_id(&client_id)?;
    state.disconnect(connection);
    Ok(StatusCode::NO_CONTENT)
}
