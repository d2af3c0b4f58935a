use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{MonitoringError, Result};

/// Kind of monitored endpoint. Selects the handler used to collect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    GeoNode,
    GeoServer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::GeoNode => "geonode",
            ServiceType::GeoServer => "geoserver",
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = MonitoringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "geonode" => Ok(ServiceType::GeoNode),
            "geoserver" => Ok(ServiceType::GeoServer),
            other => Err(MonitoringError::Configuration(format!(
                "unknown service type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub url: String,
    pub host: String,
    pub service_type: ServiceType,
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    pub last_checked: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Service {
    pub fn new(name: &str, service_type: ServiceType, check_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            url: String::new(),
            host: "localhost".to_string(),
            service_type,
            check_interval,
            last_checked: None,
            active: true,
        }
    }
}

/// A typed resource referenced by requests, e.g. `layer` / `geonode:roads`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
}

impl MonitoredResource {
    pub const LAYER: &'static str = "layer";

    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }

    pub fn layer(name: &str) -> Self {
        Self::new(Self::LAYER, name)
    }

    /// Parses the `type=name` form used in configuration.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('=') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => Ok(Self::new(kind, name)),
            _ => Err(MonitoringError::Configuration(format!(
                "resource must be written as type=name, got {:?}",
                raw
            ))),
        }
    }
}

impl std::fmt::Display for MonitoredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.resource_type, self.name)
    }
}

/// One observed request, as normalized from any raw form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    /// Identifier assigned by the data source, used to skip re-imports.
    pub source_id: Option<String>,
    pub service: String,
    pub created: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Milliseconds.
    pub response_time: f64,
    pub request_method: String,
    pub request_path: String,
    pub query_string: Option<String>,
    pub ows_service: Option<String>,
    pub response_status: u16,
    pub response_size: i64,
    pub response_type: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub resources: Vec<MonitoredResource>,
}

/// One node of an error chain. `parent` indexes the previous (outer) node of
/// the same chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: String,
    pub parent: Option<usize>,
}

/// A request event together with its exception chain, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub event: RequestEvent,
    pub exceptions: Vec<ExceptionEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub service: String,
    pub label: Option<String>,
    pub resource: Option<MonitoredResource>,
    pub ows_service: Option<String>,
    pub value: f64,
    pub value_raw: f64,
    pub samples_count: i64,
}

impl MetricValue {
    pub fn key(&self) -> MetricKey {
        MetricKey {
            metric: self.metric.clone(),
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            service: self.service.clone(),
            label: self.label.clone(),
            resource: self.resource.clone(),
            ows_service: self.ows_service.clone(),
        }
    }
}

/// Natural key of a [`MetricValue`]; at most one stored row per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub metric: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub service: String,
    pub label: Option<String>,
    pub resource: Option<MonitoredResource>,
    pub ows_service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCheck {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub definitions: Vec<MetricNotificationCheck>,
}

/// One threshold rule of a [`NotificationCheck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricNotificationCheck {
    pub id: i64,
    pub metric: String,
    pub service: Option<String>,
    pub resource: Option<MonitoredResource>,
    pub label: Option<String>,
    pub ows_service: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    #[serde(default, with = "optional_duration_secs")]
    pub max_timeout: Option<Duration>,
}

impl MetricNotificationCheck {
    pub fn new(metric: &str) -> Self {
        Self {
            id: 0,
            metric: metric.to_string(),
            service: None,
            resource: None,
            label: None,
            ows_service: None,
            min_value: None,
            max_value: None,
            max_timeout: None,
        }
    }

    pub fn is_constrained(&self) -> bool {
        self.min_value.is_some() || self.max_value.is_some() || self.max_timeout.is_some()
    }
}

pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_secs(i64::deserialize(deserializer)?)
    }

    pub(super) fn from_secs<E: Error>(secs: i64) -> Result<Duration, E> {
        Duration::try_seconds(secs)
            .ok_or_else(|| E::custom(format!("duration of {} seconds is out of range", secs)))
    }
}

pub(crate) mod optional_duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<i64>::deserialize(deserializer)?
            .map(super::duration_secs::from_secs)
            .transpose()
    }
}
