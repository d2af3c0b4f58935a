use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::{Service, ServiceType};
use crate::normalizer::RawRecord;
use crate::{MonitoringError, Result};

/// Delivers raw request records of a service for a time window.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>>;
}

/// Reads the GeoServer monitoring REST endpoint of a service.
pub struct HttpRecordSource {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl HttpRecordSource {
    pub fn new(timeout: StdDuration, credentials: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitoringError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, credentials })
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>> {
        let url = format!("{}/rest/monitor/requests.json", service.url.trim_end_matches('/'));
        let from = since.format("%Y-%m-%dT%H:%M:%S").to_string();
        let to = until.format("%Y-%m-%dT%H:%M:%S").to_string();
        debug!("Fetching {} from {} to {}", url, from, to);

        let mut request = self.client.get(&url).query(&[("from", from), ("to", to)]);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(MonitoringError::SourceUnavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        Ok(records_from_body(body))
    }
}

/// Accepts a bare array of records or an object wrapping one.
fn records_from_body(body: Value) -> Vec<RawRecord> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .find_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    items.into_iter().map(RawRecord::GeoServer).collect()
}

/// Replays a fixed set of records, ignoring the requested window.
#[derive(Default)]
pub struct StaticRecordSource {
    records: Mutex<Vec<Value>>,
    unavailable: Mutex<bool>,
}

impl StaticRecordSource {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records: Mutex::new(records),
            unavailable: Mutex::new(false),
        }
    }

    pub fn push(&self, record: Value) {
        self.records.lock().push(record);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn fetch(
        &self,
        service: &Service,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>> {
        if *self.unavailable.lock() {
            return Err(MonitoringError::SourceUnavailable(format!(
                "no records available for {}",
                service.name
            )));
        }
        Ok(self.records.lock().iter().cloned().map(RawRecord::GeoServer).collect())
    }
}

/// Requests of the host application are recorded as they happen, so a
/// collection pass has nothing to fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoNodeHandler;

#[derive(Clone)]
pub struct GeoServerHandler {
    source: Arc<dyn RecordSource>,
}

impl GeoServerHandler {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }
}

#[derive(Clone)]
pub enum ServiceHandler {
    GeoNode(GeoNodeHandler),
    GeoServer(GeoServerHandler),
}

impl ServiceHandler {
    pub async fn collect(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>> {
        match self {
            ServiceHandler::GeoNode(_) => Ok(Vec::new()),
            ServiceHandler::GeoServer(handler) => {
                let records = handler.source.fetch(service, since, until).await?;
                info!("Fetched {} records from {}", records.len(), service.name);
                Ok(records)
            }
        }
    }
}

/// Handler per service type.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<ServiceType, ServiceHandler>,
}

impl HandlerTable {
    /// GeoNode services handled in-process, GeoServer services read from
    /// `geoserver_source`.
    pub fn new(geoserver_source: Arc<dyn RecordSource>) -> Self {
        let mut table = Self::default();
        table.register(ServiceType::GeoNode, ServiceHandler::GeoNode(GeoNodeHandler));
        table.register(
            ServiceType::GeoServer,
            ServiceHandler::GeoServer(GeoServerHandler::new(geoserver_source)),
        );
        table
    }

    pub fn register(&mut self, kind: ServiceType, handler: ServiceHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn handler_for(&self, kind: ServiceType) -> Result<&ServiceHandler> {
        self.handlers.get(&kind).ok_or_else(|| {
            MonitoringError::Configuration(format!("no handler for {} services", kind.as_str()))
        })
    }
}
