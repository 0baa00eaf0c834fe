use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Decrements the live-request gauge when a tunnelled request ends.
pub struct ActiveRequestGuard;

impl ActiveRequestGuard {
    pub fn new() -> Self {
        metrics::counter!("punchgate_requests_total").increment(1);
        metrics::gauge!("punchgate_active_requests").increment(1.0);
        Self
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        metrics::gauge!("punchgate_active_requests").decrement(1.0);
    }
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
