use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordinator::{Coordinator, SharedCoordinator};
use crate::polling::{self, PollingState};
use crate::sweeper::spawn_sweeper;

/// Everything the server shares between requests: one coordinator per
/// transport binding plus the optional metrics handle.
#[derive(Clone)]
pub struct AppState {
    pub push: SharedCoordinator,
    pub polling: PollingState,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &Config, metrics: Option<PrometheusHandle>) -> Self {
        let push = Coordinator::shared("push", config.call_ttl());
        let polling = PollingState::new(
            Coordinator::shared("poll", config.poll_call_ttl()),
            config.poll_idle_timeout(),
        );
        Self {
            push,
            polling,
            metrics,
        }
    }

    /// Start the expiry sweepers and the idle polling-client reaper. The
    /// caller aborts the handles at shutdown.
    pub fn spawn_background(&self, config: &Config) -> Vec<JoinHandle<()>> {
        vec![
            spawn_sweeper(self.push.clone(), config.sweep_interval()),
            spawn_sweeper(self.polling.coordinator().clone(), config.sweep_interval()),
            polling::spawn_reaper(self.polling.clone(), config.sweep_interval()),
        ]
    }
}
