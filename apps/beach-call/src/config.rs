use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub call_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub poll_call_ttl_seconds: u64,
    pub poll_idle_timeout_seconds: u64,
    pub metrics_enabled: bool,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_host: env::var("BEACH_CALL_BIND").unwrap_or(defaults.bind_host),
            port: env_parse("BEACH_CALL_PORT", defaults.port),
            call_ttl_seconds: env_parse("CALL_TTL", defaults.call_ttl_seconds),
            sweep_interval_seconds: env_parse("CALL_SWEEP_INTERVAL", defaults.sweep_interval_seconds),
            poll_call_ttl_seconds: env_parse("POLL_CALL_TTL", defaults.poll_call_ttl_seconds),
            poll_idle_timeout_seconds: env_parse(
                "POLL_IDLE_TIMEOUT",
                defaults.poll_idle_timeout_seconds,
            ),
            metrics_enabled: env::var("BEACH_CALL_METRICS")
                .map(|value| !(value == "0" || value.eq_ignore_ascii_case("false")))
                .unwrap_or(defaults.metrics_enabled),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn call_ttl(&self) -> Duration {
        Duration::from_secs(self.call_ttl_seconds)
    }

    pub fn poll_call_ttl(&self) -> Duration {
        Duration::from_secs(self.poll_call_ttl_seconds)
    }

    pub fn poll_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_idle_timeout_seconds)
    }

    /// Never zero: a zero tokio interval panics.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 50001,
            call_ttl_seconds: 60,
            sweep_interval_seconds: 5,
            poll_call_ttl_seconds: 300, // 5 minutes
            poll_idle_timeout_seconds: 120,
            metrics_enabled: true,
        }
    }
}
