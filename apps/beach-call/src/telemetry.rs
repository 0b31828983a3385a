use anyhow::Result;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder. Metrics recorded before this (or
/// without it, as in tests) are discarded.
pub fn install_recorder() -> Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Metric emitters for one transport binding (`push` or `poll`).
#[derive(Debug, Clone, Copy)]
pub struct Telemetry {
    transport: &'static str,
}

impl Telemetry {
    pub fn new(transport: &'static str) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    pub fn offer_created(&self) {
        counter!("beach_call_offers_total", "transport" => self.transport).increment(1);
    }

    pub fn answer_accepted(&self) {
        counter!("beach_call_answers_total", "transport" => self.transport).increment(1);
    }

    pub fn candidate_relayed(&self) {
        counter!("beach_call_candidates_total", "transport" => self.transport).increment(1);
    }

    /// `reason` is one of `hangup`, `disconnect`, `expired`.
    pub fn call_ended(&self, reason: &'static str) {
        counter!(
            "beach_call_ended_total",
            "transport" => self.transport,
            "reason" => reason
        )
        .increment(1);
    }

    pub fn rejected(&self, reason: &'static str) {
        counter!(
            "beach_call_rejected_total",
            "transport" => self.transport,
            "reason" => reason
        )
        .increment(1);
    }

    pub fn malformed(&self) {
        counter!("beach_call_malformed_total", "transport" => self.transport).increment(1);
    }

    pub fn connections(&self, live: usize) {
        gauge!("beach_call_connections", "transport" => self.transport).set(live as f64);
    }

    pub fn active_calls(&self, active: usize) {
        gauge!("beach_call_active_calls", "transport" => self.transport).set(active as f64);
    }
}
