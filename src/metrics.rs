use std::sync::LazyLock;

use prometheus::*;

static METRIC_TILE_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "tessmap_tile_count",
        "count of the rendered tiles by outcome",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "tessmap_search_duration",
        "duration of the per-query similarity search in seconds",
        &["mode"]
    )
    .unwrap()
});

static METRIC_SEARCH_MATCHES: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "tessmap_search_matches",
        "number of matches returned by the per-query similarity search",
        &["mode"],
        exponential_buckets(1.0, 4.0, 8).unwrap()
    )
    .unwrap()
});

/// 按结果（ok / empty / missing / error）统计瓦片数量
pub fn inc_tile(outcome: &str) {
    METRIC_TILE_COUNT.with_label_values(&[outcome]).inc();
}

pub fn observe_search(mode: &str, duration: f64, matches: usize) {
    METRIC_SEARCH_DURATION.with_label_values(&[mode]).observe(duration);
    METRIC_SEARCH_MATCHES.with_label_values(&[mode]).observe(matches as f64);
}

/// 以文本格式导出所有指标
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather())
}
