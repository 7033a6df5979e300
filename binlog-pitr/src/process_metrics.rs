use anyhow::{Context, Result};
use binlog_pitr_storage::pitr_metrics::{Metric, COUNTERS, HISTOGRAMS};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub(crate) fn init_metrics(prom_addr: Option<SocketAddr>, stream_id: &str) -> Result<()> {
    if let Some(addr) = prom_addr {
        info!(%addr, "initializing metrics exporter");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("stream", stream_id.to_string())
            .install()
            .context("failed to install Prometheus recorder")?;
    }

    for metric in COUNTERS {
        register_counter(metric)
    }

    for metric in HISTOGRAMS {
        register_histogram(metric)
    }

    Ok(())
}

fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}
