//! In-process Prometheus collectors for the answering pipeline.
//!
//! Recording before [`init_metrics`] is a no-op; the persisted daily metrics
//! in `rag_db` remain the durable record.

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static QUERIES: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_HITS: OnceLock<IntCounter> = OnceLock::new();
static RECOVERED_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();
static QUERY_DURATION: OnceLock<Histogram> = OnceLock::new();
static TOKENS_USED: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("rag_queries_total", "Questions answered per intent and outcome"),
        &["intent", "outcome"],
    ) {
        if QUERIES.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(counter) = IntCounter::new("rag_cache_hits_total", "Answers served from the query cache") {
        if CACHE_HITS.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(counter) = IntCounterVec::new(
        prometheus::opts!("rag_recovered_errors_total", "Failures recovered inside the pipeline"),
        &["kind"],
    ) {
        if RECOVERED_ERRORS.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if let Ok(histogram) = Histogram::with_opts(HistogramOpts::new(
        "rag_query_duration_seconds",
        "End-to-end time to answer a question",
    )) {
        if QUERY_DURATION.set(histogram.clone()).is_ok() {
            REGISTRY.register(Box::new(histogram)).ok();
        }
    }

    if let Ok(counter) = IntCounter::new("rag_tokens_used_total", "Completion tokens consumed") {
        if TOKENS_USED.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }
}

pub fn inc_query(intent: &str, outcome: &str) {
    if let Some(counter) = QUERIES.get() {
        counter.with_label_values(&[intent, outcome]).inc();
    }
}

pub fn inc_cache_hit() {
    if let Some(counter) = CACHE_HITS.get() {
        counter.inc();
    }
}

pub fn inc_recovered(kind: &str) {
    if let Some(counter) = RECOVERED_ERRORS.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn observe_query_duration(seconds: f64) {
    if let Some(histogram) = QUERY_DURATION.get() {
        histogram.observe(seconds);
    }
}

pub fn add_tokens(tokens: u32) {
    if let Some(counter) = TOKENS_USED.get() {
        counter.inc_by(tokens as u64);
    }
}

/// Text exposition of everything registered so far.
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Metrics were not UTF-8: {}", e))
}
