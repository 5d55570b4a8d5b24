use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the Prometheus recorder and returns the render handle served
/// by `/metrics`.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Connection and pairing gauges.
pub mod gauges {
    /// Increment the live-supervisor gauge.
    pub fn inc_ws_clients() {
        metrics::gauge!("ws_clients").increment(1.0);
    }

    /// Decrement the live-supervisor gauge.
    pub fn dec_ws_clients() {
        metrics::gauge!("ws_clients").decrement(1.0);
    }

    /// Set the mutual-pairing gauge to the scanned count.
    pub fn set_ws_pairs(pairs: usize) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("ws_pairs").set(pairs as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a successfully forwarded signal of the given kind.
    pub fn signals_total(kind: &'static str) {
        metrics::counter!("ws_signals_total", "kind" => kind).increment(1);
    }

    /// Record a parse, validation, rate-limit, queue, or bus failure.
    pub fn errors_total() {
        metrics::counter!("ws_errors_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the handling latency of one inbound frame in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("ws_relay_latency_seconds").record(value);
    }
}
