use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;

/// Which side of a threshold rule a stored value crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Minimum,
    Maximum,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Minimum => write!(f, "below minimum"),
            Bound::Maximum => write!(f, "above maximum"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Metric {metric} {bound}: value {value} against threshold {threshold}")]
    MetricOutOfRange {
        metric: String,
        value: f64,
        threshold: f64,
        bound: Bound,
    },

    #[error("Metric {metric} timed out: last seen {last_seen}, allowed {}s", .max_timeout.num_seconds())]
    MetricTimeout {
        metric: String,
        last_seen: DateTime<Utc>,
        max_timeout: Duration,
    },

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitoringError {
    /// True for a crossed threshold or a stale metric.
    pub fn is_threshold_violation(&self) -> bool {
        matches!(
            self,
            MonitoringError::MetricOutOfRange { .. } | MonitoringError::MetricTimeout { .. }
        )
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, MonitoringError::NoData(_))
    }
}

impl From<duckdb::Error> for MonitoringError {
    fn from(err: duckdb::Error) -> Self {
        MonitoringError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for MonitoringError {
    fn from(err: serde_json::Error) -> Self {
        MonitoringError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MonitoringError {
    fn from(err: reqwest::Error) -> Self {
        MonitoringError::SourceUnavailable(err.to_string())
    }
}

impl IntoResponse for MonitoringError {
    fn into_response(self) -> Response {
        let status = match self {
            MonitoringError::Configuration(_)
            | MonitoringError::Normalization(_)
            | MonitoringError::Serialization(_) => StatusCode::BAD_REQUEST,
            MonitoringError::NoData(_) | MonitoringError::NotFound(_) => StatusCode::NOT_FOUND,
            MonitoringError::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
            MonitoringError::MetricOutOfRange { .. }
            | MonitoringError::MetricTimeout { .. }
            | MonitoringError::Database(_)
            | MonitoringError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MonitoringError>;
