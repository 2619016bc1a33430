use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;

use crate::executor::Executor;

/// Install the Prometheus recorder and return the handle for scraping.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record the executor's pool stats as gauges, labelled with its schema.
pub fn record_pool_stats(executor: &Executor) {
    let pool = executor.pool();
    let schema = executor.schema().to_owned();
    ::metrics::gauge!("nebula.pool.size", "schema" => schema.clone()).set(pool.size() as f64);
    ::metrics::gauge!("nebula.pool.idle", "schema" => schema.clone()).set(pool.num_idle() as f64);
    ::metrics::gauge!("nebula.pool.max_size", "schema" => schema)
        .set(pool.options().get_max_connections() as f64);
}
