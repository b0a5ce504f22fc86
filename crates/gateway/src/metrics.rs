use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static QUERY_COST: OnceLock<Histogram> = OnceLock::new();
static BATCH_FLUSHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BATCH_KEYS: OnceLock<HistogramVec> = OnceLock::new();
static UPSTREAM_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LEDGER_ENTRIES: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "unigraph_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create unigraph_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "unigraph_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create unigraph_http_request_duration_seconds"),
        )
    })
}

fn operations_total() -> &'static IntCounterVec {
    OPERATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "unigraph_operations_total",
                    "GraphQL operations by kind and outcome.",
                ),
                &["kind", "outcome"],
            )
            .expect("create unigraph_operations_total"),
        )
    })
}

fn rejections_total() -> &'static IntCounterVec {
    REJECTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "unigraph_rejections_total",
                    "Operations rejected before execution, by error code.",
                ),
                &["code"],
            )
            .expect("create unigraph_rejections_total"),
        )
    })
}

fn query_cost() -> &'static Histogram {
    QUERY_COST.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new("unigraph_query_cost", "Computed cost of each operation.")
                    .buckets(vec![
                        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
                    ]),
            )
            .expect("create unigraph_query_cost"),
        )
    })
}

fn batch_flushes_total() -> &'static IntCounterVec {
    BATCH_FLUSHES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "unigraph_batch_flushes_total",
                    "Batch coalescer flushes by loader and outcome.",
                ),
                &["loader", "outcome"],
            )
            .expect("create unigraph_batch_flushes_total"),
        )
    })
}

fn batch_keys() -> &'static HistogramVec {
    BATCH_KEYS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "unigraph_batch_keys",
                    "Distinct keys fetched per batch flush.",
                )
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
                &["loader"],
            )
            .expect("create unigraph_batch_keys"),
        )
    })
}

fn upstream_requests_total() -> &'static IntCounterVec {
    UPSTREAM_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "unigraph_upstream_requests_total",
                    "Upstream REST requests by endpoint and outcome.",
                ),
                &["endpoint", "outcome"],
            )
            .expect("create unigraph_upstream_requests_total"),
        )
    })
}

fn ledger_entries() -> &'static IntGauge {
    LEDGER_ENTRIES.get_or_init(|| {
        register_collector(
            IntGauge::new("unigraph_ledger_entries", "Entries held by the query ledger.")
                .expect("create unigraph_ledger_entries"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_operation(kind: &str, success: bool) {
    let outcome = if success { "success" } else { "error" };
    operations_total().with_label_values(&[kind, outcome]).inc();
}

pub fn observe_rejection(code: &str) {
    rejections_total().with_label_values(&[code]).inc();
}

pub fn observe_query_cost(cost: u64) {
    query_cost().observe(cost as f64);
}

pub fn observe_batch_flush(loader: &str, keys: usize, success: bool) {
    let outcome = if success { "success" } else { "error" };
    batch_flushes_total()
        .with_label_values(&[loader, outcome])
        .inc();
    batch_keys()
        .with_label_values(&[loader])
        .observe(keys as f64);
}

pub fn observe_upstream_request(endpoint: &str, outcome: &str) {
    upstream_requests_total()
        .with_label_values(&[endpoint, outcome])
        .inc();
}

pub fn set_ledger_entries(len: usize) {
    ledger_entries().set(i64::try_from(len).unwrap_or(i64::MAX));
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = ledger_entries();
    let _ = rejections_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
