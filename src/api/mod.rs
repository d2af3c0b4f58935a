pub mod routes;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::aggregator::MetricAggregator;
use crate::checks::CheckEngine;
use crate::store::MonitoringStore;
use crate::{MonitoringError, Result};

#[derive(Clone)]
pub struct AppState {
    pub store: MonitoringStore,
    pub aggregator: MetricAggregator,
    pub checks: CheckEngine,
}

impl AppState {
    pub fn new(store: MonitoringStore, checks: CheckEngine) -> Self {
        Self {
            aggregator: MetricAggregator::new(store.clone()),
            store,
            checks,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/services", get(routes::list_services))
        .route("/metrics/:name", get(routes::get_metric))
        .route("/checks", get(routes::get_checks))
        .route("/prometheus", get(routes::prometheus))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("Serving monitoring API on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| MonitoringError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, router(state))
        .await
        .map_err(|e| MonitoringError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
