use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use duckdb::{params, Connection};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{
    ExceptionEvent, MetricNotificationCheck, MetricValue, MonitoredResource, NormalizedRequest,
    NotificationCheck, RequestEvent, Service, ServiceType,
};
use crate::periods::from_millis;
use crate::{MonitoringError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS services (
        name VARCHAR PRIMARY KEY,
        url VARCHAR NOT NULL,
        host VARCHAR NOT NULL,
        service_type VARCHAR NOT NULL,
        check_interval_secs BIGINT NOT NULL,
        last_checked BIGINT,
        active BOOLEAN NOT NULL
    );
    CREATE SEQUENCE IF NOT EXISTS seq_resources START 1;
    CREATE TABLE IF NOT EXISTS monitored_resources (
        id BIGINT PRIMARY KEY DEFAULT nextval('seq_resources'),
        type VARCHAR NOT NULL,
        name VARCHAR NOT NULL,
        UNIQUE (type, name)
    );
    CREATE SEQUENCE IF NOT EXISTS seq_request_events START 1;
    CREATE TABLE IF NOT EXISTS request_events (
        id BIGINT PRIMARY KEY DEFAULT nextval('seq_request_events'),
        service VARCHAR NOT NULL,
        source_id VARCHAR,
        created BIGINT NOT NULL,
        finished BIGINT NOT NULL,
        response_time DOUBLE NOT NULL,
        request_method VARCHAR NOT NULL,
        request_path VARCHAR NOT NULL,
        query_string VARCHAR,
        ows_service VARCHAR,
        response_status INTEGER NOT NULL,
        response_size BIGINT NOT NULL,
        response_type VARCHAR,
        client_ip VARCHAR,
        user_agent VARCHAR,
        UNIQUE (service, source_id)
    );
    CREATE TABLE IF NOT EXISTS request_resources (
        request_id BIGINT NOT NULL,
        resource_id BIGINT NOT NULL,
        position INTEGER NOT NULL
    );
    CREATE SEQUENCE IF NOT EXISTS seq_exception_events START 1;
    CREATE TABLE IF NOT EXISTS exception_events (
        id BIGINT PRIMARY KEY DEFAULT nextval('seq_exception_events'),
        request_id BIGINT NOT NULL,
        parent_id BIGINT,
        error_type VARCHAR NOT NULL,
        error_message VARCHAR NOT NULL,
        stack_trace VARCHAR NOT NULL
    );
    CREATE TABLE IF NOT EXISTS metric_values (
        metric VARCHAR NOT NULL,
        bucket_start BIGINT NOT NULL,
        bucket_end BIGINT NOT NULL,
        service VARCHAR NOT NULL,
        label VARCHAR NOT NULL,
        resource_type VARCHAR NOT NULL,
        resource_name VARCHAR NOT NULL,
        ows_service VARCHAR NOT NULL,
        value DOUBLE NOT NULL,
        value_raw DOUBLE NOT NULL,
        samples_count BIGINT NOT NULL,
        UNIQUE (metric, bucket_start, bucket_end, service, label, resource_type, resource_name, ows_service)
    );
    CREATE SEQUENCE IF NOT EXISTS seq_notification_checks START 1;
    CREATE TABLE IF NOT EXISTS notification_checks (
        id BIGINT PRIMARY KEY DEFAULT nextval('seq_notification_checks'),
        name VARCHAR NOT NULL UNIQUE,
        description VARCHAR NOT NULL,
        active BOOLEAN NOT NULL
    );
    CREATE SEQUENCE IF NOT EXISTS seq_metric_checks START 1;
    CREATE TABLE IF NOT EXISTS metric_notification_checks (
        id BIGINT PRIMARY KEY DEFAULT nextval('seq_metric_checks'),
        check_id BIGINT NOT NULL,
        metric VARCHAR NOT NULL,
        service VARCHAR,
        resource_type VARCHAR,
        resource_name VARCHAR,
        label VARCHAR,
        ows_service VARCHAR,
        min_value DOUBLE,
        max_value DOUBLE,
        max_timeout_secs BIGINT
    );
";

/// A request event as persisted, with its exception chain in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    pub id: i64,
    pub event: RequestEvent,
    pub exceptions: Vec<ExceptionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The source already delivered this request; holds the existing id.
    Duplicate(i64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearedData {
    pub requests: usize,
    pub exceptions: usize,
    pub metric_values: usize,
}

/// duckdb-backed persistence. Every statement goes through one connection
/// guarded by an async mutex, so writers are serialized.
#[derive(Clone)]
pub struct MonitoringStore {
    db: Arc<Mutex<Connection>>,
}

impl MonitoringStore {
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(None)
    }

    pub async fn upsert_service(&self, service: &Service) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO services (name, url, host, service_type, check_interval_secs, last_checked, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                url = excluded.url,
                host = excluded.host,
                service_type = excluded.service_type,
                check_interval_secs = excluded.check_interval_secs,
                active = excluded.active",
            params![
                service.name,
                service.url,
                service.host,
                service.service_type.as_str(),
                service.check_interval.num_seconds(),
                service.last_checked.map(|ts| ts.timestamp_millis()),
                service.active,
            ],
        )?;
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<Service> {
        self.list_services()
            .await?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| MonitoringError::NotFound(format!("Service {} not found", name)))
    }

    pub async fn list_services(&self) -> Result<Vec<Service>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, url, host, service_type, check_interval_secs, last_checked, active
             FROM services ORDER BY name",
        )?;
        let rows = stmt.query_map(params![], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;

        let mut services = Vec::new();
        for row in rows {
            let (name, url, host, kind, interval, last_checked, active) = row?;
            services.push(Service {
                name,
                url,
                host,
                service_type: kind.parse::<ServiceType>()?,
                check_interval: stored_secs(interval)?,
                last_checked: last_checked.map(from_millis).transpose()?,
                active,
            });
        }
        Ok(services)
    }

    pub async fn set_last_checked(&self, service: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        let updated = conn.execute(
            "UPDATE services SET last_checked = ?1 WHERE name = ?2",
            params![at.timestamp_millis(), service],
        )?;
        if updated == 0 {
            return Err(MonitoringError::NotFound(format!("Service {} not found", service)));
        }
        Ok(())
    }

    /// Persist a normalized request with its resources and exception chain
    /// in one transaction. Requests carrying a source id already stored for
    /// the same service are not inserted again.
    pub async fn insert_request(&self, request: &NormalizedRequest) -> Result<InsertOutcome> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let event = &request.event;

        if let Some(source_id) = &event.source_id {
            let mut stmt = tx.prepare(
                "SELECT id FROM request_events WHERE service = ?1 AND source_id = ?2",
            )?;
            let mut rows = stmt.query(params![event.service, source_id])?;
            if let Some(row) = rows.next()? {
                return Ok(InsertOutcome::Duplicate(row.get(0)?));
            }
        }

        let request_id: i64 = tx.query_row(
            "INSERT INTO request_events (service, source_id, created, finished, response_time,
                request_method, request_path, query_string, ows_service, response_status,
                response_size, response_type, client_ip, user_agent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             RETURNING id",
            params![
                event.service,
                event.source_id,
                event.created.timestamp_millis(),
                event.finished.timestamp_millis(),
                event.response_time,
                event.request_method,
                event.request_path,
                event.query_string,
                event.ows_service,
                event.response_status as i32,
                event.response_size,
                event.response_type,
                event.client_ip,
                event.user_agent,
            ],
            |row| row.get(0),
        )?;

        for (position, resource) in event.resources.iter().enumerate() {
            let resource_id = get_or_create_resource(&tx, resource)?;
            tx.execute(
                "INSERT INTO request_resources (request_id, resource_id, position) VALUES (?1, ?2, ?3)",
                params![request_id, resource_id, position as i32],
            )?;
        }

        let mut chain_ids: Vec<i64> = Vec::with_capacity(request.exceptions.len());
        for exc in &request.exceptions {
            let parent_id = exc.parent.and_then(|idx| chain_ids.get(idx).copied());
            let id: i64 = tx.query_row(
                "INSERT INTO exception_events (request_id, parent_id, error_type, error_message, stack_trace)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING id",
                params![request_id, parent_id, exc.error_type, exc.error_message, exc.stack_trace],
                |row| row.get(0),
            )?;
            chain_ids.push(id);
        }
        tx.commit()?;

        debug!(
            "Stored request {} for {} with {} exception(s)",
            request_id,
            event.service,
            chain_ids.len()
        );
        Ok(InsertOutcome::Inserted(request_id))
    }

    pub async fn count_requests(&self, service: &str) -> Result<i64> {
        let conn = self.db.lock().await;
        Ok(conn.query_row(
            "SELECT count(*) FROM request_events WHERE service = ?1",
            params![service],
            |row| row.get(0),
        )?)
    }

    pub async fn get_or_create_resource(&self, resource: &MonitoredResource) -> Result<i64> {
        let conn = self.db.lock().await;
        get_or_create_resource(&conn, resource)
    }

    /// Requests of `service` created in `[start, end)`, oldest first.
    pub async fn requests_between(
        &self,
        service: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredRequest>> {
        let conn = self.db.lock().await;
        let (start, end) = (start.timestamp_millis(), end.timestamp_millis());

        let mut stmt = conn.prepare(
            "SELECT id, source_id, created, finished, response_time, request_method, request_path,
                    query_string, ows_service, response_status, response_size, response_type,
                    client_ip, user_agent
             FROM request_events
             WHERE service = ?1 AND created >= ?2 AND created < ?3
             ORDER BY created, id",
        )?;
        let rows = stmt.query_map(params![service, start, end], |row| {
            Ok(RequestRow {
                id: row.get(0)?,
                source_id: row.get(1)?,
                created: row.get(2)?,
                finished: row.get(3)?,
                response_time: row.get(4)?,
                request_method: row.get(5)?,
                request_path: row.get(6)?,
                query_string: row.get(7)?,
                ows_service: row.get(8)?,
                response_status: row.get(9)?,
                response_size: row.get(10)?,
                response_type: row.get(11)?,
                client_ip: row.get(12)?,
                user_agent: row.get(13)?,
            })
        })?;
        let request_rows = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        let mut resources: HashMap<i64, Vec<MonitoredResource>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT rr.request_id, r.type, r.name
             FROM request_resources rr
             JOIN monitored_resources r ON r.id = rr.resource_id
             JOIN request_events e ON e.id = rr.request_id
             WHERE e.service = ?1 AND e.created >= ?2 AND e.created < ?3
             ORDER BY rr.request_id, rr.position",
        )?;
        let rows = stmt.query_map(params![service, start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (request_id, kind, name) = row?;
            resources
                .entry(request_id)
                .or_default()
                .push(MonitoredResource::new(&kind, &name));
        }

        let mut exceptions: HashMap<i64, Vec<(i64, Option<i64>, ExceptionEvent)>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT x.request_id, x.id, x.parent_id, x.error_type, x.error_message, x.stack_trace
             FROM exception_events x
             JOIN request_events e ON e.id = x.request_id
             WHERE e.service = ?1 AND e.created >= ?2 AND e.created < ?3
             ORDER BY x.request_id, x.id",
        )?;
        let rows = stmt.query_map(params![service, start, end], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                ExceptionEvent {
                    error_type: row.get(3)?,
                    error_message: row.get(4)?,
                    stack_trace: row.get(5)?,
                    parent: None,
                },
            ))
        })?;
        for row in rows {
            let (request_id, id, parent_id, exc) = row?;
            exceptions.entry(request_id).or_default().push((id, parent_id, exc));
        }

        let mut out = Vec::with_capacity(request_rows.len());
        for row in request_rows {
            let id = row.id;
            let chain = exceptions.remove(&id).unwrap_or_default();
            let ids: Vec<i64> = chain.iter().map(|(id, _, _)| *id).collect();
            let chain = chain
                .into_iter()
                .map(|(_, parent_id, mut exc)| {
                    exc.parent = parent_id.and_then(|pid| ids.iter().position(|&i| i == pid));
                    exc
                })
                .collect();
            out.push(StoredRequest {
                id,
                event: row.into_event(service, resources.remove(&id).unwrap_or_default())?,
                exceptions: chain,
            });
        }
        Ok(out)
    }

    /// Upsert every value on its natural key inside one transaction.
    pub async fn upsert_metric_values(&self, values: &[MetricValue]) -> Result<usize> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        for value in values {
            let (resource_type, resource_name) = match &value.resource {
                Some(r) => (r.resource_type.as_str(), r.name.as_str()),
                None => ("", ""),
            };
            tx.execute(
                "INSERT INTO metric_values (metric, bucket_start, bucket_end, service, label,
                    resource_type, resource_name, ows_service, value, value_raw, samples_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (metric, bucket_start, bucket_end, service, label, resource_type, resource_name, ows_service)
                 DO UPDATE SET
                    value = excluded.value,
                    value_raw = excluded.value_raw,
                    samples_count = excluded.samples_count",
                params![
                    value.metric,
                    value.bucket_start.timestamp_millis(),
                    value.bucket_end.timestamp_millis(),
                    value.service,
                    value.label.as_deref().unwrap_or(""),
                    resource_type,
                    resource_name,
                    value.ows_service.as_deref().unwrap_or(""),
                    value.value,
                    value.value_raw,
                    value.samples_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(values.len())
    }

    /// Values of `metric` whose bucket starts in `[start, end)`.
    pub async fn metric_values(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricValue>> {
        self.select_metric_values(
            "WHERE metric = ?1 AND bucket_start >= ?2 AND bucket_start < ?3
             ORDER BY bucket_start, service, label, resource_type, resource_name, ows_service",
            metric,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
        .await
    }

    /// Values of `metric` whose bucket started at or before `at`, newest first.
    pub async fn metric_values_until(
        &self,
        metric: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricValue>> {
        self.select_metric_values(
            "WHERE metric = ?1 AND bucket_start >= ?2 AND bucket_start <= ?3
             ORDER BY bucket_end DESC",
            metric,
            i64::MIN,
            at.timestamp_millis(),
        )
        .await
    }

    /// Values of `metric` whose bucket contains `at`, whatever its length.
    pub async fn metric_values_at(&self, metric: &str, at: DateTime<Utc>) -> Result<Vec<MetricValue>> {
        self.select_metric_values(
            "WHERE metric = ?1 AND bucket_start <= ?2 AND bucket_end > ?3
             ORDER BY bucket_start, service, label, resource_type, resource_name, ows_service",
            metric,
            at.timestamp_millis(),
            at.timestamp_millis(),
        )
        .await
    }

    async fn select_metric_values(
        &self,
        clause: &str,
        metric: &str,
        low: i64,
        high: i64,
    ) -> Result<Vec<MetricValue>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT metric, bucket_start, bucket_end, service, label, resource_type,
                    resource_name, ows_service, value, value_raw, samples_count
             FROM metric_values {}",
            clause
        ))?;
        let rows = stmt.query_map(params![metric, low, high], |row| {
            Ok(MetricRow {
                metric: row.get(0)?,
                bucket_start: row.get(1)?,
                bucket_end: row.get(2)?,
                service: row.get(3)?,
                label: row.get(4)?,
                resource_type: row.get(5)?,
                resource_name: row.get(6)?,
                ows_service: row.get(7)?,
                value: row.get(8)?,
                value_raw: row.get(9)?,
                samples_count: row.get(10)?,
            })
        })?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?.into_value()?);
        }
        Ok(values)
    }

    pub async fn delete_metric_values(&self, metric: &str) -> Result<usize> {
        let conn = self.db.lock().await;
        Ok(conn.execute("DELETE FROM metric_values WHERE metric = ?1", params![metric])?)
    }

    /// Drop request events (with their exceptions and resource links) created
    /// before `cutoff`, and metric values whose bucket ended by then.
    pub async fn clear_before(&self, cutoff: DateTime<Utc>) -> Result<ClearedData> {
        let conn = self.db.lock().await;
        let cutoff = cutoff.timestamp_millis();

        let exceptions = conn.execute(
            "DELETE FROM exception_events
             WHERE request_id IN (SELECT id FROM request_events WHERE created < ?1)",
            params![cutoff],
        )?;
        conn.execute(
            "DELETE FROM request_resources
             WHERE request_id IN (SELECT id FROM request_events WHERE created < ?1)",
            params![cutoff],
        )?;
        let requests = conn.execute("DELETE FROM request_events WHERE created < ?1", params![cutoff])?;
        let metric_values =
            conn.execute("DELETE FROM metric_values WHERE bucket_end <= ?1", params![cutoff])?;

        Ok(ClearedData {
            requests,
            exceptions,
            metric_values,
        })
    }

    /// Create a notification check, or replace the definitions of the check
    /// with the same name.
    pub async fn save_notification_check(
        &self,
        name: &str,
        description: &str,
        definitions: &[MetricNotificationCheck],
    ) -> Result<NotificationCheck> {
        let conn = self.db.lock().await;

        let existing: Option<i64> = {
            let mut stmt = conn.prepare("SELECT id FROM notification_checks WHERE name = ?1")?;
            let mut rows = stmt.query(params![name])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        let check_id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE notification_checks SET description = ?1 WHERE id = ?2",
                    params![description, id],
                )?;
                conn.execute(
                    "DELETE FROM metric_notification_checks WHERE check_id = ?1",
                    params![id],
                )?;
                id
            }
            None => conn.query_row(
                "INSERT INTO notification_checks (name, description, active)
                 VALUES (?1, ?2, TRUE) RETURNING id",
                params![name, description],
                |row| row.get(0),
            )?,
        };

        let mut saved = Vec::with_capacity(definitions.len());
        for def in definitions {
            let id: i64 = conn.query_row(
                "INSERT INTO metric_notification_checks (check_id, metric, service, resource_type,
                    resource_name, label, ows_service, min_value, max_value, max_timeout_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 RETURNING id",
                params![
                    check_id,
                    def.metric,
                    def.service,
                    def.resource.as_ref().map(|r| r.resource_type.clone()),
                    def.resource.as_ref().map(|r| r.name.clone()),
                    def.label,
                    def.ows_service,
                    def.min_value,
                    def.max_value,
                    def.max_timeout.map(|d| d.num_seconds()),
                ],
                |row| row.get(0),
            )?;
            saved.push(MetricNotificationCheck { id, ..def.clone() });
        }

        Ok(NotificationCheck {
            id: check_id,
            name: name.to_string(),
            description: description.to_string(),
            active: true,
            definitions: saved,
        })
    }

    pub async fn set_check_active(&self, name: &str, active: bool) -> Result<()> {
        let conn = self.db.lock().await;
        let updated = conn.execute(
            "UPDATE notification_checks SET active = ?1 WHERE name = ?2",
            params![active, name],
        )?;
        if updated == 0 {
            return Err(MonitoringError::NotFound(format!("Notification check {} not found", name)));
        }
        Ok(())
    }

    pub async fn notification_checks(&self, active_only: bool) -> Result<Vec<NotificationCheck>> {
        let conn = self.db.lock().await;

        let mut stmt = conn.prepare(
            "SELECT id, name, description, active FROM notification_checks ORDER BY id",
        )?;
        let rows = stmt.query_map(params![], |row| {
            Ok(NotificationCheck {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                active: row.get(3)?,
                definitions: Vec::new(),
            })
        })?;
        let mut checks = rows
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|c| c.active || !active_only)
            .collect::<Vec<_>>();

        let mut stmt = conn.prepare(
            "SELECT check_id, id, metric, service, resource_type, resource_name, label,
                    ows_service, min_value, max_value, max_timeout_secs
             FROM metric_notification_checks ORDER BY check_id, id",
        )?;
        let rows = stmt.query_map(params![], |row| {
            let resource_type: Option<String> = row.get(4)?;
            let resource_name: Option<String> = row.get(5)?;
            let max_timeout: Option<i64> = row.get(10)?;
            Ok((
                row.get::<_, i64>(0)?,
                max_timeout,
                MetricNotificationCheck {
                    id: row.get(1)?,
                    metric: row.get(2)?,
                    service: row.get(3)?,
                    resource: resource_type
                        .zip(resource_name)
                        .map(|(kind, name)| MonitoredResource::new(&kind, &name)),
                    label: row.get(6)?,
                    ows_service: row.get(7)?,
                    min_value: row.get(8)?,
                    max_value: row.get(9)?,
                    max_timeout: None,
                },
            ))
        })?;
        for row in rows {
            let (check_id, max_timeout, mut def) = row?;
            def.max_timeout = max_timeout.map(stored_secs).transpose()?;
            if let Some(check) = checks.iter_mut().find(|c| c.id == check_id) {
                check.definitions.push(def);
            }
        }

        Ok(checks)
    }
}

fn stored_secs(secs: i64) -> Result<Duration> {
    Duration::try_seconds(secs)
        .ok_or_else(|| MonitoringError::Internal(format!("stored duration out of range: {}s", secs)))
}

fn get_or_create_resource(conn: &Connection, resource: &MonitoredResource) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT id FROM monitored_resources WHERE type = ?1 AND name = ?2")?;
    let mut rows = stmt.query(params![resource.resource_type, resource.name])?;
    if let Some(row) = rows.next()? {
        return Ok(row.get(0)?);
    }
    Ok(conn.query_row(
        "INSERT INTO monitored_resources (type, name) VALUES (?1, ?2) RETURNING id",
        params![resource.resource_type, resource.name],
        |row| row.get(0),
    )?)
}

struct RequestRow {
    id: i64,
    source_id: Option<String>,
    created: i64,
    finished: i64,
    response_time: f64,
    request_method: String,
    request_path: String,
    query_string: Option<String>,
    ows_service: Option<String>,
    response_status: i32,
    response_size: i64,
    response_type: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
}

impl RequestRow {
    fn into_event(self, service: &str, resources: Vec<MonitoredResource>) -> Result<RequestEvent> {
        Ok(RequestEvent {
            source_id: self.source_id,
            service: service.to_string(),
            created: from_millis(self.created)?,
            finished: from_millis(self.finished)?,
            response_time: self.response_time,
            request_method: self.request_method,
            request_path: self.request_path,
            query_string: self.query_string,
            ows_service: self.ows_service,
            response_status: self.response_status as u16,
            response_size: self.response_size,
            response_type: self.response_type,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            resources,
        })
    }
}

struct MetricRow {
    metric: String,
    bucket_start: i64,
    bucket_end: i64,
    service: String,
    label: String,
    resource_type: String,
    resource_name: String,
    ows_service: String,
    value: f64,
    value_raw: f64,
    samples_count: i64,
}

impl MetricRow {
    fn into_value(self) -> Result<MetricValue> {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        let resource = if self.resource_type.is_empty() && self.resource_name.is_empty() {
            None
        } else {
            Some(MonitoredResource::new(&self.resource_type, &self.resource_name))
        };
        Ok(MetricValue {
            metric: self.metric,
            bucket_start: from_millis(self.bucket_start)?,
            bucket_end: from_millis(self.bucket_end)?,
            service: self.service,
            label: non_empty(self.label),
            resource,
            ows_service: non_empty(self.ows_service),
            value: self.value,
            value_raw: self.value_raw,
            samples_count: self.samples_count,
        })
    }
}
