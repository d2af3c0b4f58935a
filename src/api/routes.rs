use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use super::AppState;
use crate::aggregator::{MetricFilter, MetricSeries};
use crate::checks::CheckReport;
use crate::metrics;
use crate::models::{MonitoredResource, Service};
use crate::normalizer::parse_timestamp;
use crate::{MonitoringError, Result};

const DEFAULT_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Default, Deserialize)]
pub struct MetricQuery {
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    pub interval_secs: Option<i64>,
    pub service: Option<String>,
    /// `type=name`
    pub resource: Option<String>,
    pub label: Option<String>,
    pub ows_service: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    pub as_of: Option<String>,
}

fn parse_param(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|raw| {
        parse_timestamp(raw)
            .map_err(|_| MonitoringError::Configuration(format!("invalid {}: {:?}", name, raw)))
    })
    .transpose()
}

pub async fn list_services(State(state): State<AppState>) -> Result<Json<Vec<Service>>> {
    Ok(Json(state.store.list_services().await?))
}

pub async fn get_metric(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<MetricQuery>,
) -> Result<Json<MetricSeries>> {
    info!("Getting metric series: {}", name);

    let interval_secs = query.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
    let interval = Duration::try_seconds(interval_secs)
        .filter(|interval| *interval > Duration::zero())
        .ok_or_else(|| {
            MonitoringError::Configuration(format!("invalid interval_secs: {}", interval_secs))
        })?;
    let valid_to = parse_param("valid_to", query.valid_to.as_deref())?.unwrap_or_else(Utc::now);
    let valid_from = match parse_param("valid_from", query.valid_from.as_deref())? {
        Some(valid_from) => valid_from,
        None => valid_to.checked_sub_signed(Duration::hours(1)).ok_or_else(|| {
            MonitoringError::Configuration(format!("invalid valid_to: {}", valid_to))
        })?,
    };
    if valid_to <= valid_from {
        return Err(MonitoringError::Configuration(
            "valid_to must be after valid_from".to_string(),
        ));
    }

    let filter = MetricFilter {
        service: query.service,
        resource: query.resource.as_deref().map(MonitoredResource::parse).transpose()?,
        label: query.label,
        ows_service: query.ows_service.map(|s| s.to_ascii_uppercase()),
    };

    let series = state
        .aggregator
        .get_metrics_for(&name, valid_from, valid_to, interval, &filter)
        .await?;
    Ok(Json(series))
}

pub async fn get_checks(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<Vec<CheckReport>>> {
    let as_of = parse_param("as_of", query.as_of.as_deref())?.unwrap_or_else(Utc::now);
    Ok(Json(state.checks.check_for(as_of).await?))
}

pub async fn prometheus() -> Result<impl IntoResponse> {
    let body = metrics::gather()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
