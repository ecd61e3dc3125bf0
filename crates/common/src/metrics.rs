use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Metrics registry for the worker pipeline and the distributed queue.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    dequeue_total: CounterVec,
    dequeue_wait_seconds: HistogramVec,
    match_total: CounterVec,
    stage_claims: GaugeVec,
    stage_operations_total: CounterVec,
    stage_seconds: HistogramVec,
    poll_ticks_total: CounterVec,
}

impl MetricsRegistry {
    /// Build an empty registry with all families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one dequeue attempt and its wall-clock wait.
    pub fn record_dequeue(&self, queue: &str, outcome: &str, wait_secs: f64) {
        let labels = [queue, outcome];
        self.inner.dequeue_total.with_label_values(&labels).inc();
        self.inner
            .dequeue_wait_seconds
            .with_label_values(&[queue])
            .observe(wait_secs.max(0.0));
    }

    /// Record one match attempt outcome (`matched` / `unmatched`).
    pub fn record_match(&self, outcome: &str) {
        self.inner.match_total.with_label_values(&[outcome]).inc();
    }

    /// Set the held-claim count of a stage.
    pub fn set_stage_claims(&self, stage: &str, claims: u64) {
        self.inner
            .stage_claims
            .with_label_values(&[stage])
            .set(claims as f64);
    }

    /// Record one operation leaving a stage (`forwarded` / `errored`) and the
    /// time the stage spent on it.
    pub fn record_stage_operation(&self, stage: &str, outcome: &str, secs: f64) {
        self.inner
            .stage_operations_total
            .with_label_values(&[stage, outcome])
            .inc();
        self.inner
            .stage_seconds
            .with_label_values(&[stage])
            .observe(secs.max(0.0));
    }

    /// Record one poller liveness tick at an execution stage.
    pub fn inc_poll_tick(&self, stage: &str) {
        self.inner
            .poll_ticks_total
            .with_label_values(&[stage])
            .inc();
    }

    /// Render all families in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let dequeue_total = counter_vec(
            &registry,
            "ffx_dequeue_total",
            "Dequeue attempts per queue and outcome",
            &["queue", "outcome"],
        );
        let dequeue_wait_seconds = histogram_vec(
            &registry,
            "ffx_dequeue_wait_seconds",
            "Time spent waiting on the queue",
            &["queue"],
        );
        let match_total = counter_vec(
            &registry,
            "ffx_match_total",
            "Match attempts per outcome",
            &["outcome"],
        );
        let stage_claims = gauge_vec(
            &registry,
            "ffx_stage_claims",
            "Currently held claims per stage",
            &["stage"],
        );
        let stage_operations_total = counter_vec(
            &registry,
            "ffx_stage_operations_total",
            "Operations leaving each stage per outcome",
            &["stage", "outcome"],
        );
        let stage_seconds = histogram_vec(
            &registry,
            "ffx_stage_seconds",
            "Time spent per operation in each stage",
            &["stage"],
        );
        let poll_ticks_total = counter_vec(
            &registry,
            "ffx_poll_ticks_total",
            "Poller liveness ticks per execution stage",
            &["stage"],
        );

        Self {
            registry,
            dequeue_total,
            dequeue_wait_seconds,
            match_total,
            stage_claims,
            stage_operations_total,
            stage_seconds,
            poll_ticks_total,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_dequeue("{ops}:queue", "hit", 0.02);
        let text = m.render_prometheus();
        assert!(text.contains("ffx_dequeue_total"));
        assert!(text.contains("{ops}:queue"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_dequeue("{ops}:queue", "empty", 0.05);
        m.record_match("matched");
        m.set_stage_claims("ExecuteActionStage", 3);
        m.record_stage_operation("InputFetchStage", "forwarded", 0.01);
        m.inc_poll_tick("QUEUED");
        let text = m.render_prometheus();

        assert!(text.contains("ffx_dequeue_total"));
        assert!(text.contains("ffx_dequeue_wait_seconds"));
        assert!(text.contains("ffx_match_total"));
        assert!(text.contains("ffx_stage_claims"));
        assert!(text.contains("ffx_stage_operations_total"));
        assert!(text.contains("ffx_stage_seconds"));
        assert!(text.contains("ffx_poll_ticks_total"));
    }
}
