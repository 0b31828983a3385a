use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::calls::{AcceptOutcome, CallError, CallStore};
use crate::protocol::{InboundMessage, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbox};
use crate::relay;
use crate::telemetry::Telemetry;

pub type SharedCoordinator = Arc<Coordinator>;

/// Owns the connection registry and the call store for one transport
/// binding, and applies the signaling protocol to them.
///
/// All methods are synchronous: outbound delivery only pushes into the
/// connection outboxes, so no operation ever waits on a socket.
pub struct Coordinator {
    registry: ConnectionRegistry,
    calls: CallStore,
    call_ttl: Duration,
    telemetry: Telemetry,
}

impl Coordinator {
    pub fn new(transport: &'static str, call_ttl: Duration) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            calls: CallStore::new(),
            call_ttl,
            telemetry: Telemetry::new(transport),
        }
    }

    pub fn shared(transport: &'static str, call_ttl: Duration) -> SharedCoordinator {
        Arc::new(Self::new(transport, call_ttl))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn calls(&self) -> &CallStore {
        &self.calls
    }

    pub fn call_ttl(&self) -> Duration {
        self.call_ttl
    }

    /// Register a new client, tell it its identity, then announce every
    /// call still waiting for an answer.
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        let connection = self.registry.register_with(outbox, |id| ServerMessage::welcome(id));

        let pending = self.calls.pending_offers(Instant::now(), self.call_ttl);
        let announced = pending.len();
        for (call_id, offer) in pending {
            self.registry
                .send(connection, ServerMessage::new_call(&call_id, offer));
        }

        info!(
            transport = self.telemetry.transport(),
            connection = %connection,
            live = self.registry.len(),
            announced,
            "client connected"
        );
        self.telemetry.connections(self.registry.len());
        connection
    }

    /// Entry point for one inbound frame. Malformed frames are logged and
    /// otherwise ignored.
    pub fn handle_text(&self, connection: ConnectionId, text: &str) {
        if !self.registry.is_live(connection) {
            debug!(connection = %connection, "ignoring frame from unregistered connection");
            return;
        }

        self.sweep(Instant::now());

        match InboundMessage::decode(text) {
            Ok(message) => self.dispatch(connection, message),
            Err(err) => {
                warn!(connection = %connection, error = %err, "malformed signaling message");
                self.telemetry.malformed();
            }
        }
    }

    pub fn dispatch(&self, connection: ConnectionId, message: InboundMessage) {
        debug!(
            connection = %connection,
            kind = message.kind(),
            call_id = message.call_id(),
            "dispatching"
        );
        let result = match message {
            InboundMessage::Offer { call_id, offer } => self.handle_offer(connection, &call_id, offer),
            InboundMessage::Answer { call_id, answer } => {
                self.handle_answer(connection, &call_id, answer)
            }
            InboundMessage::Candidate { call_id, candidate } => {
                self.handle_candidate(connection, &call_id, candidate)
            }
            InboundMessage::EndCall { call_id } => {
                self.handle_end_call(connection, &call_id);
                Ok(())
            }
        };

        // Rejections are answered with silence.
        if let Err(err) = result {
            debug!(connection = %connection, error = %err, "signaling message rejected");
            self.telemetry.rejected(err.reason());
        }
    }

    fn handle_offer(
        &self,
        caller: ConnectionId,
        call_id: &str,
        offer: Value,
    ) -> Result<(), CallError> {
        self.calls.create_offer_while(
            call_id,
            caller,
            offer.clone(),
            Instant::now(),
            |id| self.registry.is_live(id),
        )?;
        let notified = self
            .registry
            .broadcast_except(&[caller], &ServerMessage::new_call(call_id, offer));

        info!(call_id, caller = %caller, notified, "call offered");
        self.telemetry.offer_created();
        self.telemetry.active_calls(self.calls.len());
        Ok(())
    }

    fn handle_answer(
        &self,
        answerer: ConnectionId,
        call_id: &str,
        answer: Value,
    ) -> Result<(), CallError> {
        let outcome = relay::accept_and_flush(
            &self.calls,
            &self.registry,
            call_id,
            answerer,
            answer.clone(),
        )?;

        let caller = match outcome {
            AcceptOutcome::Accepted { caller } => caller,
            AcceptOutcome::AlreadyAnswered => {
                info!(call_id, answerer = %answerer, "call already answered");
                self.telemetry.rejected("already_answered");
                return Ok(());
            }
        };

        self.registry
            .send(caller, ServerMessage::call_answered(call_id, answer));
        self.registry
            .broadcast_except(&[caller, answerer], &ServerMessage::call_taken(call_id));

        info!(call_id, caller = %caller, answerer = %answerer, "call answered");
        self.telemetry.answer_accepted();
        Ok(())
    }

    fn handle_candidate(
        &self,
        from: ConnectionId,
        call_id: &str,
        candidate: Value,
    ) -> Result<(), CallError> {
        let peer = relay::relay_candidate(&self.calls, &self.registry, call_id, from, candidate)?;
        if peer.is_none() {
            debug!(call_id, from = %from, "candidate buffered until the call is answered");
        }
        self.telemetry.candidate_relayed();
        Ok(())
    }

    fn handle_end_call(&self, requester: ConnectionId, call_id: &str) {
        let Some(participants) = self.calls.end(call_id) else {
            debug!(call_id, requester = %requester, "end requested for unknown call");
            return;
        };

        for participant in participants.iter() {
            self.registry.send(participant, ServerMessage::call_ended(call_id));
        }

        info!(call_id, requester = %requester, "call ended");
        self.telemetry.call_ended("hangup");
        self.telemetry.active_calls(self.calls.len());
    }

    /// Disconnected transition: drop the connection, then tear down every
    /// call it took part in and tell the other side. Safe to call twice.
    pub fn disconnect(&self, connection: ConnectionId) {
        let was_live = self.registry.unregister(connection);

        let ended = self.calls.remove_if_participant(connection);
        for call in &ended {
            if let Some(survivor) = call.survivor {
                self.registry
                    .send(survivor, ServerMessage::call_ended(&call.call_id));
            }
            self.telemetry.call_ended("disconnect");
        }

        if was_live {
            info!(
                transport = self.telemetry.transport(),
                connection = %connection,
                live = self.registry.len(),
                ended_calls = ended.len(),
                "client disconnected"
            );
        }
        self.telemetry.connections(self.registry.len());
        self.telemetry.active_calls(self.calls.len());
    }

    /// Reclaim unanswered calls older than the TTL and notify their
    /// participants. Returns how many calls were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = self.calls.sweep_expired(now, self.call_ttl);
        for call in &expired {
            info!(call_id = %call.call_id, caller = %call.participants.caller, "call expired");
            for participant in call.participants.iter() {
                self.registry
                    .send(participant, ServerMessage::call_ended(&call.call_id));
            }
            self.telemetry.call_ended("expired");
        }
        if !expired.is_empty() {
            self.telemetry.active_calls(self.calls.len());
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn connect(coordinator: &Coordinator) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = coordinator.connect(tx);
            let mut client = Self { id, rx };
            assert_eq!(client.next(), Some(ServerMessage::welcome(id)));
            client
        }

        fn next(&mut self) -> Option<ServerMessage> {
            self.rx.try_recv().ok()
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            std::iter::from_fn(|| self.next()).collect()
        }

        fn send(&self, coordinator: &Coordinator, text: &str) {
            coordinator.handle_text(self.id, text);
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new("push", Duration::from_secs(60))
    }

    #[test]
    fn offer_answer_candidate_round() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);
        let mut c = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![ServerMessage::new_call("c1", json!("O"))]);
        assert_eq!(c.drain(), vec![ServerMessage::new_call("c1", json!("O"))]);

        b.send(&coordinator, r#"{"call_id":"c1","answer":"X"}"#);
        assert_eq!(
            a.drain(),
            vec![ServerMessage::call_answered("c1", json!("X"))]
        );
        assert_eq!(c.drain(), vec![ServerMessage::call_taken("c1")]);
        assert!(b.drain().is_empty());

        a.send(&coordinator, r#"{"call_id":"c1","candidate":{"candidate":"a=1"}}"#);
        assert_eq!(
            b.drain(),
            vec![ServerMessage::ice_candidate("c1", json!({"candidate": "a=1"}))]
        );

        b.send(&coordinator, r#"{"call_id":"c1","candidate":"b=1"}"#);
        assert_eq!(
            a.drain(),
            vec![ServerMessage::ice_candidate("c1", json!("b=1"))]
        );
        assert!(c.drain().is_empty());
    }

    #[test]
    fn late_joiner_learns_pending_calls_only() {
        let coordinator = coordinator();
        let a = Client::connect(&coordinator);
        let b = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"open","offer":"O1"}"#);
        a.send(&coordinator, r#"{"call_id":"taken","offer":"O2"}"#);
        b.send(&coordinator, r#"{"call_id":"taken","answer":"X"}"#);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let late = coordinator.connect(tx);
        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();

        assert_eq!(
            received,
            vec![
                ServerMessage::welcome(late),
                ServerMessage::new_call("open", json!("O1")),
            ]
        );
    }

    #[test]
    fn duplicate_offer_and_losing_answer_are_silent() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);
        let mut c = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        b.drain();
        c.drain();

        b.send(&coordinator, r#"{"call_id":"c1","offer":"hijack"}"#);
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
        assert_eq!(coordinator.calls().get("c1").unwrap().caller, a.id);

        b.send(&coordinator, r#"{"call_id":"c1","answer":"B"}"#);
        c.send(&coordinator, r#"{"call_id":"c1","answer":"C"}"#);

        assert_eq!(
            a.drain(),
            vec![ServerMessage::call_answered("c1", json!("B"))]
        );
        assert_eq!(c.drain(), vec![ServerMessage::call_taken("c1")]);
        assert!(b.drain().is_empty());
        assert_eq!(coordinator.calls().get("c1").unwrap().answerer(), Some(b.id));

        c.send(&coordinator, r#"{"call_id":"missing","answer":"C"}"#);
        c.send(&coordinator, r#"{"call_id":"c1","candidate":"intruder"}"#);
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn malformed_frames_do_not_disturb_the_connection() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);

        a.send(&coordinator, "{not json");
        a.send(&coordinator, r#"{"call_id":"c1"}"#);
        a.send(&coordinator, r#"{"offer":"O"}"#);
        assert!(coordinator.registry().is_live(a.id));
        assert!(b.drain().is_empty());

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        assert_eq!(b.drain(), vec![ServerMessage::new_call("c1", json!("O"))]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn end_call_notifies_participants_once() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);
        let mut c = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        b.send(&coordinator, r#"{"call_id":"c1","answer":"X"}"#);
        a.drain();
        b.drain();
        c.drain();

        b.send(&coordinator, r#"{"type":"end_call","call_id":"c1"}"#);
        b.send(&coordinator, r#"{"type":"end_call","call_id":"c1"}"#);

        assert_eq!(a.drain(), vec![ServerMessage::call_ended("c1")]);
        assert_eq!(b.drain(), vec![ServerMessage::call_ended("c1")]);
        assert!(c.drain().is_empty());
        assert!(coordinator.calls().is_empty());
    }

    #[test]
    fn caller_disconnect_before_answer_is_silent() {
        let coordinator = coordinator();
        let a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        b.drain();
        coordinator.disconnect(a.id);

        assert!(b.drain().is_empty());
        assert!(coordinator.calls().get("c1").is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let late = coordinator.connect(tx);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::welcome(late));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_of_either_side_notifies_the_survivor_once() {
        for caller_leaves in [true, false] {
            let coordinator = coordinator();
            let mut a = Client::connect(&coordinator);
            let mut b = Client::connect(&coordinator);
            let mut c = Client::connect(&coordinator);

            a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
            b.send(&coordinator, r#"{"call_id":"c1","answer":"X"}"#);
            a.drain();
            b.drain();
            c.drain();

            let (leaving, survivor) = if caller_leaves {
                (a.id, &mut b)
            } else {
                (b.id, &mut a)
            };
            coordinator.disconnect(leaving);
            coordinator.disconnect(leaving);

            assert_eq!(survivor.drain(), vec![ServerMessage::call_ended("c1")]);
            assert!(c.drain().is_empty());
            assert!(coordinator.calls().is_empty());
        }
    }

    #[test]
    fn frames_from_unregistered_connections_are_ignored() {
        let coordinator = coordinator();
        let a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);
        coordinator.disconnect(a.id);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);

        assert!(coordinator.calls().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn sweep_notifies_caller_and_hides_the_call() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        b.drain();

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(coordinator.sweep(later), 1);
        assert_eq!(coordinator.sweep(later), 0);

        assert_eq!(a.drain(), vec![ServerMessage::call_ended("c1")]);
        assert!(b.drain().is_empty());
        assert!(coordinator.calls().is_empty());
    }

    #[test]
    fn frames_dispatched_after_disconnect_leave_no_trace() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let b = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        coordinator.disconnect(b.id);
        coordinator.dispatch(
            b.id,
            InboundMessage::Answer {
                call_id: "c1".into(),
                answer: json!("X"),
            },
        );
        assert_eq!(coordinator.calls().get("c1").unwrap().answerer(), None);
        assert!(a.drain().is_empty());

        coordinator.disconnect(a.id);
        coordinator.dispatch(
            a.id,
            InboundMessage::Offer {
                call_id: "c2".into(),
                offer: json!("O2"),
            },
        );
        assert!(coordinator.calls().is_empty());

        let mut late = Client::connect(&coordinator);
        assert!(late.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frame_reclaims_expired_calls() {
        let coordinator = coordinator();
        let mut a = Client::connect(&coordinator);
        let mut b = Client::connect(&coordinator);

        a.send(&coordinator, r#"{"call_id":"c1","offer":"O"}"#);
        b.drain();

        tokio::time::advance(Duration::from_secs(61)).await;
        b.send(&coordinator, r#"{"type":"end_call","call_id":"unrelated"}"#);

        assert_eq!(a.drain(), vec![ServerMessage::call_ended("c1")]);
        assert!(b.drain().is_empty());
        assert!(coordinator.calls().is_empty());
    }
}
