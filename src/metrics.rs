use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::web::InitError;

/// Install the global Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle, InitError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| InitError::Metrics(e.to_string()))
}

/// Register every flight board metric at zero so it is scraped before the first request
pub fn initialize_flight_metrics() {
    metrics::counter!("flight_requests_total").absolute(0);
    metrics::counter!("flight_pool_acquire_failed_total").absolute(0);
    metrics::counter!("flight_query_failed_total").absolute(0);
    metrics::counter!("flight_query_timeouts_total").absolute(0);
    metrics::counter!("flight_connection_faults_total").absolute(0);
    metrics::gauge!("flight_pool_outstanding").set(0.0);
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Serve `/metrics` on its own listener
pub async fn serve_metrics(listener: TcpListener, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle);

    match axum::serve(listener, app).await {
        Ok(()) => info!("Metrics server stopped"),
        Err(e) => error!("Metrics server failed: {}", e),
    }
}
