use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::coordinator::SharedCoordinator;

/// Periodically reclaim unanswered calls. The same sweep also runs before
/// every inbound frame; this task covers idle periods.
pub fn spawn_sweeper(coordinator: SharedCoordinator, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let reclaimed = coordinator.sweep(Instant::now());
            if reclaimed > 0 {
                debug!(reclaimed, "expiry sweep reclaimed calls");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::protocol::ServerMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_is_reclaimed_on_the_timer() {
        let coordinator = Coordinator::shared("push", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let caller = coordinator.connect(tx);
        coordinator.handle_text(caller, r#"{"call_id":"c1","offer":"O"}"#);

        let sweeper = spawn_sweeper(coordinator.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(coordinator.calls().get("c1").is_some());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(coordinator.calls().is_empty());

        assert_eq!(rx.recv().await, Some(ServerMessage::welcome(caller)));
        assert_eq!(rx.recv().await, Some(ServerMessage::call_ended("c1")));
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn answered_call_survives_the_timer() {
        let coordinator = Coordinator::shared("push", Duration::from_secs(60));
        let (tx, _caller_rx) = mpsc::unbounded_channel();
        let caller = coordinator.connect(tx);
        let (tx, _answerer_rx) = mpsc::unbounded_channel();
        let answerer = coordinator.connect(tx);

        coordinator.handle_text(caller, r#"{"call_id":"c1","offer":"O"}"#);
        let sweeper = spawn_sweeper(coordinator.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(59)).await;
        coordinator.handle_text(answerer, r#"{"call_id":"c1","answer":"X"}"#);

        tokio::time::sleep(Duration::from_secs(600)).await;
        let call = coordinator.calls().get("c1").expect("answered call kept");
        assert_eq!(call.answered.map(|a| a.answer), Some(json!("X")));
        sweeper.abort();
    }
}
