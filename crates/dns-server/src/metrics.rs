//! Prometheus counters for the serving core.  The enclosing process
//! decides how (and whether) to expose them.

use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0025, // 2.5 ms
    0.0050, // 5   ms
    0.0075, // 7.5 ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.0750, // 75  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    0.7500, // 750 ms
    1.0000, // 1    s
];

pub static DNS_REQUESTS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "dns_requests_total",
                "Total number of DNS requests received, whether valid or invalid."
            ),
            &["protocol"]
        )
        .unwrap()
    });

pub static DNS_RESPONSES_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!("dns_responses_total", "Total number of DNS responses sent."),
            &["protocol", "aa", "tc", "rcode"]
        )
        .unwrap()
    });

pub static DNS_RESPONSE_TIME_SECONDS: std::sync::LazyLock<HistogramVec> =
    std::sync::LazyLock::new(|| {
        register_histogram_vec!(
            "dns_response_time_seconds",
            "Response time of DNS requests, whether valid or invalid.",
            &["protocol"],
            RESPONSE_TIME_BUCKETS.to_vec()
        )
        .unwrap()
    });

pub static ZONES_LOADED: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge!(opts!(
        "zones_loaded",
        "Number of zones in the published snapshot."
    ))
    .unwrap()
});

pub static ZONE_RELOADS_TOTAL: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec!(
            opts!(
                "zone_reloads_total",
                "Total number of zone reloads, by outcome."
            ),
            &["outcome"]
        )
        .unwrap()
    });

pub static NOTIFY_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "notify_total",
            "Total number of outbound NOTIFY exchanges, by outcome."
        ),
        &["outcome"]
    )
    .unwrap()
});

pub static QUIC_CONNECTIONS_ACTIVE: std::sync::LazyLock<IntGauge> =
    std::sync::LazyLock::new(|| {
        register_int_gauge!(opts!(
            "quic_connections_active",
            "QUIC connections currently being served."
        ))
        .unwrap()
    });
