// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

// Single custom registry (everything registers here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Execution --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("paper_orders_total", "orders processed (label: status)"),
        &["status"],
    )
    .unwrap()
});

pub static REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("paper_rejections_total", "rejected orders by code"),
        &["code"],
    )
    .unwrap()
});

pub static IDEMPOTENT_REPLAYS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("paper_idempotent_replays_total", "orders answered from history"),
        &["source"],
    )
    .unwrap()
});

// -------- Account --------
pub static EQUITY_CENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("paper_equity_cents", "marked equity (cents)").unwrap());

pub static CASH_CENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("paper_cash_cents", "cash balance (cents)").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("paper_open_positions", "open positions").unwrap());

// 0 ok, 1 watch, 2 restrict, 3 halt
pub static RISK_LEVEL: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("paper_risk_level", "current risk level (0..=3)").unwrap());

// -------- Market data routing --------
pub static PROVIDER_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "market_data_requests_total",
            "provider attempts (labels: provider, kind, outcome)",
        ),
        &["provider", "kind", "outcome"],
    )
    .unwrap()
});

pub static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("market_data_cache_hits_total", "router cache hits (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static CIRCUIT_OPENED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("market_data_circuit_opened_total", "circuit breaker trips"),
        &["provider"],
    )
    .unwrap()
});

pub static COALESCED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "market_data_coalesced_total",
            "requests that joined an in-flight fetch",
        ),
        &["kind"],
    )
    .unwrap()
});

/// Register everything on the custom registry. Safe to call more than once.
pub fn init() {
    for m in [
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(REJECTIONS.clone())),
        REGISTRY.register(Box::new(IDEMPOTENT_REPLAYS.clone())),
        REGISTRY.register(Box::new(EQUITY_CENTS.clone())),
        REGISTRY.register(Box::new(CASH_CENTS.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(RISK_LEVEL.clone())),
        REGISTRY.register(Box::new(PROVIDER_REQUESTS.clone())),
        REGISTRY.register(Box::new(CACHE_HITS.clone())),
        REGISTRY.register(Box::new(CIRCUIT_OPENED.clone())),
        REGISTRY.register(Box::new(COALESCED.clone())),
    ] {
        // AlreadyReg on a second init is fine
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

pub fn content_type() -> &'static str {
    "text/plain; version=0.0.4; charset=utf-8"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        init();
        ORDERS.with_label_values(&["filled"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("paper_orders_total"));
    }
}
