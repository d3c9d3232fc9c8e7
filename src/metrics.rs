//! Request metrics sink.
//!
//! The router reports latency, token counts and errors per `(provider, model)`; the
//! HTTP layer reports rejected API requests per `(endpoint, method, status)`.
//! `PrometheusMetrics` aggregates in memory and renders the text exposition format
//! served on `/metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use crate::models::Provider;

/// Prometheus client default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Prompt,
    Completion,
    Total,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Prompt => "prompt",
            TokenKind::Completion => "completion",
            TokenKind::Total => "total",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn observe_latency(&self, provider: Provider, model: &str, seconds: f64);
    fn observe_tokens(&self, provider: Provider, model: &str, kind: TokenKind, count: u64);
    fn observe_error(&self, provider: Provider, model: &str);

    /// An HTTP request answered with an error status (auth rejections included).
    fn observe_api_error(&self, _endpoint: &str, _method: &str, _status: u16) {}

    /// Text exposition, when the sink keeps its own state.
    fn render(&self) -> Option<String> {
        None
    }
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_latency(&self, _: Provider, _: &str, _: f64) {}
    fn observe_tokens(&self, _: Provider, _: &str, _: TokenKind, _: u64) {}
    fn observe_error(&self, _: Provider, _: &str) {}
}

type SeriesKey = (Provider, String);

#[derive(Debug, Clone)]
struct Histogram {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: usize) -> Self {
        Self {
            counts: vec![0; buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        for (slot, le) in self.counts.iter_mut().zip(bounds) {
            if value <= *le {
                *slot += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct State {
    latency: BTreeMap<SeriesKey, Histogram>,
    tokens: BTreeMap<(Provider, String, TokenKind), u64>,
    errors: BTreeMap<SeriesKey, u64>,
    api_errors: BTreeMap<(String, String, u16), u64>,
}

/// In-process aggregation with Prometheus text rendering.
#[derive(Debug)]
pub struct PrometheusMetrics {
    buckets: Vec<f64>,
    state: Mutex<State>,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS.to_vec())
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buckets(mut buckets: Vec<f64>) -> Self {
        buckets.retain(|b| b.is_finite());
        buckets.sort_by(|a, b| a.total_cmp(b));
        buckets.dedup();
        Self {
            buckets,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn error_count(&self, provider: Provider, model: &str) -> u64 {
        self.state()
            .errors
            .get(&(provider, model.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn token_count(&self, provider: Provider, model: &str, kind: TokenKind) -> u64 {
        self.state()
            .tokens
            .get(&(provider, model.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn api_error_count(&self, endpoint: &str, method: &str, status: u16) -> u64 {
        self.state()
            .api_errors
            .get(&(endpoint.to_string(), method.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    pub fn latency_count(&self, provider: Provider, model: &str) -> u64 {
        self.state()
            .latency
            .get(&(provider, model.to_string()))
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Render every series in the Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let state = self.state();
        let mut out = String::new();

        out.push_str("# HELP llm_request_latency_seconds Time spent processing LLM requests\n");
        out.push_str("# TYPE llm_request_latency_seconds histogram\n");
        for ((provider, model), h) in &state.latency {
            let labels = format!("provider=\"{}\",model=\"{}\"", provider, escape(model));
            for (le, count) in self.buckets.iter().zip(&h.counts) {
                let _ = writeln!(
                    out,
                    "llm_request_latency_seconds_bucket{{{labels},le=\"{le}\"}} {count}"
                );
            }
            let _ = writeln!(
                out,
                "llm_request_latency_seconds_bucket{{{labels},le=\"+Inf\"}} {}",
                h.count
            );
            let _ = writeln!(out, "llm_request_latency_seconds_sum{{{labels}}} {}", h.sum);
            let _ = writeln!(out, "llm_request_latency_seconds_count{{{labels}}} {}", h.count);
        }

        out.push_str("# HELP llm_tokens_total Total number of tokens processed\n");
        out.push_str("# TYPE llm_tokens_total counter\n");
        for ((provider, model, kind), value) in &state.tokens {
            let _ = writeln!(
                out,
                "llm_tokens_total{{provider=\"{}\",model=\"{}\",type=\"{}\"}} {}",
                provider,
                escape(model),
                kind.as_str(),
                value
            );
        }

        out.push_str("# HELP llm_request_errors_total Total number of LLM request errors\n");
        out.push_str("# TYPE llm_request_errors_total counter\n");
        for ((provider, model), value) in &state.errors {
            let _ = writeln!(
                out,
                "llm_request_errors_total{{provider=\"{}\",model=\"{}\"}} {}",
                provider,
                escape(model),
                value
            );
        }

        out.push_str("# HELP api_request_errors_total Total number of API request errors\n");
        out.push_str("# TYPE api_request_errors_total counter\n");
        for ((endpoint, method, status), value) in &state.api_errors {
            let _ = writeln!(
                out,
                "api_request_errors_total{{endpoint=\"{}\",method=\"{}\",status=\"{}\"}} {}",
                escape(endpoint),
                escape(method),
                status,
                value
            );
        }

        out
    }
}

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl MetricsSink for PrometheusMetrics {
    fn observe_latency(&self, provider: Provider, model: &str, seconds: f64) {
        let bounds = &self.buckets;
        let mut state = self.state();
        state
            .latency
            .entry((provider, model.to_string()))
            .or_insert_with(|| Histogram::new(bounds.len()))
            .observe(bounds, seconds);
    }

    fn observe_tokens(&self, provider: Provider, model: &str, kind: TokenKind, count: u64) {
        *self
            .state()
            .tokens
            .entry((provider, model.to_string(), kind))
            .or_insert(0) += count;
    }

    fn observe_error(&self, provider: Provider, model: &str) {
        *self
            .state()
            .errors
            .entry((provider, model.to_string()))
            .or_insert(0) += 1;
    }

    fn observe_api_error(&self, endpoint: &str, method: &str, status: u16) {
        *self
            .state()
            .api_errors
            .entry((endpoint.to_string(), method.to_string(), status))
            .or_insert(0) += 1;
    }

    fn render(&self) -> Option<String> {
        Some(self.export_prometheus())
    }
}
