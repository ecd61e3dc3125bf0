use serde::{Deserialize, Serialize};

/// Backplane/queue configuration shared by the worker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneConfig {
    /// Backplane endpoint (for example `redis://127.0.0.1:6379`).
    pub url: String,
    /// Base name of the operation queue. The `_dequeue` suffix is reserved
    /// for the in-flight sibling list.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Blocking dequeue timeout in milliseconds. Zero degenerates to the
    /// non-blocking variant.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Poller tick period in milliseconds. Keep at or below half of the
    /// backplane's liveness window.
    #[serde(default = "default_poller_period_ms")]
    pub poller_period_ms: u64,
}

fn default_queue_name() -> String {
    "{ops}:queue".to_string()
}

fn default_dequeue_timeout_ms() -> u64 {
    1_000
}

fn default_poller_period_ms() -> u64 {
    10_000
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            queue_name: default_queue_name(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            poller_period_ms: default_poller_period_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BackplaneConfig;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let cfg: BackplaneConfig =
            serde_json::from_str(r#"{"url":"redis://backplane:6379"}"#).expect("decode config");
        assert_eq!(cfg.url, "redis://backplane:6379");
        assert_eq!(cfg.queue_name, "{ops}:queue");
        assert_eq!(cfg.dequeue_timeout_ms, 1_000);
        assert_eq!(cfg.poller_period_ms, 10_000);
    }
}
