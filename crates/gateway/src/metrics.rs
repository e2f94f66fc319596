//! Prometheus metrics.
//!
//! Each server owns its own registry (no process-global state), so tests can
//! build as many instances as they like. Metric updates are infallible after
//! construction; observability never affects request semantics.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use vx_sessions::StoreStats;

pub struct Metrics {
    registry: Registry,

    // Counters
    pub turns_started: IntCounter,
    pub turns_completed: IntCounterVec,
    pub turns_cancelled: IntCounter,
    pub tool_calls: IntCounterVec,
    pub tool_cache: IntCounterVec,
    pub llm_calls: IntCounterVec,
    pub durable_errors: IntGauge,

    // Gauges
    pub active_sessions: IntGauge,
    pub streams_in_flight: IntGauge,

    // Histograms
    pub turn_duration: Histogram,
    pub llm_first_token: Histogram,
    pub tts_first_chunk: Histogram,
    pub tool_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let turns_started =
            IntCounter::with_opts(Opts::new("voxgate_turns_started_total", "Turns started"))?;
        let turns_completed = IntCounterVec::new(
            Opts::new("voxgate_turns_completed_total", "Turns completed, by outcome"),
            &["outcome"],
        )?;
        let turns_cancelled = IntCounter::with_opts(Opts::new(
            "voxgate_turns_cancelled_total",
            "Turns cancelled by the client or deadline",
        ))?;
        let tool_calls = IntCounterVec::new(
            Opts::new("voxgate_tool_calls_total", "Tool dispatches, by tool and outcome"),
            &["tool", "outcome"],
        )?;
        let tool_cache = IntCounterVec::new(
            Opts::new("voxgate_tool_cache_total", "Tool cache lookups, by result"),
            &["result"],
        )?;
        let llm_calls = IntCounterVec::new(
            Opts::new("voxgate_llm_calls_total", "LLM calls, by model and outcome"),
            &["model", "outcome"],
        )?;
        let durable_errors = IntGauge::with_opts(Opts::new(
            "voxgate_durable_errors_total",
            "Durable-tier write/read failures observed",
        ))?;
        let active_sessions = IntGauge::with_opts(Opts::new(
            "voxgate_active_sessions",
            "Sessions resident in the hot tier",
        ))?;
        let streams_in_flight = IntGauge::with_opts(Opts::new(
            "voxgate_streams_in_flight",
            "Event streams currently open",
        ))?;
        let turn_duration = Histogram::with_opts(
            HistogramOpts::new("voxgate_turn_duration_seconds", "Wall-clock time per turn")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let llm_first_token = Histogram::with_opts(
            HistogramOpts::new(
                "voxgate_llm_first_token_seconds",
                "Latency from LLM request to first token",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        let tts_first_chunk = Histogram::with_opts(
            HistogramOpts::new(
                "voxgate_tts_first_chunk_seconds",
                "Latency from synthesis request to first audio chunk",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        )?;
        let tool_duration = HistogramVec::new(
            HistogramOpts::new("voxgate_tool_duration_seconds", "Tool dispatch latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["tool"],
        )?;

        registry.register(Box::new(turns_started.clone()))?;
        registry.register(Box::new(turns_completed.clone()))?;
        registry.register(Box::new(turns_cancelled.clone()))?;
        registry.register(Box::new(tool_calls.clone()))?;
        registry.register(Box::new(tool_cache.clone()))?;
        registry.register(Box::new(llm_calls.clone()))?;
        registry.register(Box::new(durable_errors.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(streams_in_flight.clone()))?;
        registry.register(Box::new(turn_duration.clone()))?;
        registry.register(Box::new(llm_first_token.clone()))?;
        registry.register(Box::new(tts_first_chunk.clone()))?;
        registry.register(Box::new(tool_duration.clone()))?;

        Ok(Self {
            registry,
            turns_started,
            turns_completed,
            turns_cancelled,
            tool_calls,
            tool_cache,
            llm_calls,
            durable_errors,
            active_sessions,
            streams_in_flight,
            turn_duration,
            llm_first_token,
            tts_first_chunk,
            tool_duration,
        })
    }

    /// Render the text exposition format, refreshing store-derived gauges.
    pub fn render(&self, stats: &StoreStats) -> String {
        self.active_sessions.set(stats.hot_sessions as i64);
        self.durable_errors.set(stats.durable_errors as i64);

        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "metrics encoding failed");
                String::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_stats() -> StoreStats {
        StoreStats {
            hot_sessions: 3,
            hot_messages: 12,
            durable_backed: false,
            durable_errors: 1,
        }
    }

    #[test]
    fn two_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.turns_started.inc();
        assert_eq!(a.turns_started.get(), 1);
        assert_eq!(b.turns_started.get(), 0);
    }

    #[test]
    fn render_includes_counters_and_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.turns_started.inc();
        metrics
            .tool_calls
            .with_label_values(&["web_search", "ok"])
            .inc();
        let text = metrics.render(&empty_stats());
        assert!(text.contains("voxgate_turns_started_total 1"));
        assert!(text.contains("voxgate_active_sessions 3"));
        assert!(text.contains(r#"tool="web_search""#));
    }
}
