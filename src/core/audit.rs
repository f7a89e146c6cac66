//! Audit sink for admission decisions.
//!
//! Every admitted or rejected request yields one `AdmissionRecord`. The
//! enqueue side never blocks request completion: the channel is bounded and
//! drops under pressure. A writer task persists records to the audit store;
//! retention sweeps evict old records on a daily cadence with an hourly
//! catch-up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Store(String),
    #[error("record serialization error: {0}")]
    Serialization(String),
}

/// One admission decision, serialized as a schema-free document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub id: String,
    pub client_ip: String,
    pub request_path: String,
    pub http_method: String,
    pub user_agent: Option<String>,
    /// Request headers with sensitive entries removed.
    pub request_headers: HashMap<String, String>,
    pub response_status: Option<u16>,
    pub processing_time_ms: u64,
    pub rate_limited: bool,
    pub rate_limit_type: Option<String>,
    pub in_whitelist: bool,
    pub trace_id: String,
    pub access_time: DateTime<Utc>,
}

impl AdmissionRecord {
    pub fn access_time_ms(&self) -> i64 {
        self.access_time.timestamp_millis()
    }

    pub fn is_ddos_related(&self) -> bool {
        self.rate_limit_type
            .as_deref()
            .map_or(false, |t| t.starts_with("DDOS"))
    }
}

/// Remove credentials and secret-bearing headers before serialization.
pub fn filter_sensitive_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_lowercase();
            lowered != "authorization"
                && lowered != "cookie"
                && !lowered.contains("token")
                && !lowered.contains("password")
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Persistence contract for admission records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AdmissionRecord) -> Result<(), AuditError>;

    /// Newest-first records for one IP.
    async fn find_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError>;

    async fn count(&self) -> Result<u64, AuditError>;

    /// Newest-first records whose limit type marks DDoS involvement.
    async fn find_ddos(&self, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError>;

    /// Evict records older than the cutoff; returns how many went away.
    async fn evict_older_than(&self, cutoff_ms: i64) -> Result<u64, AuditError>;
}

/// In-process audit store for single-node deployments and tests.
pub struct MemoryAuditStore {
    records: Mutex<Vec<AdmissionRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AdmissionRecord) -> Result<(), AuditError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record.clone());
        Ok(())
    }

    async fn find_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.client_ip == ip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, AuditError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.len() as u64)
    }

    async fn find_ddos(&self, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.is_ddos_related())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn evict_older_than(&self, cutoff_ms: i64) -> Result<u64, AuditError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|record| record.access_time_ms() >= cutoff_ms);
        Ok((before - records.len()) as u64)
    }
}

/// Redis-backed audit store: one sorted set scored by access-time millis,
/// members are the serialized records.
pub struct RedisAuditStore {
    client: redis::Client,
    key: String,
}

impl RedisAuditStore {
    pub fn new(client: redis::Client, key: &str) -> Self {
        Self {
            client,
            key: key.to_string(),
        }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, AuditError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| AuditError::Store(e.to_string()))
    }

    async fn all_records(&self) -> Result<Vec<AdmissionRecord>, AuditError> {
        let mut conn = self.connection().await?;
        let blobs: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;

        Ok(blobs
            .into_iter()
            .filter_map(|blob| match serde_json::from_str(&blob) {
                Ok(record) => Some(record),
                Err(err) => {
                    error!("skipping unparsable audit record: {}", err);
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl AuditStore for RedisAuditStore {
    async fn append(&self, record: &AdmissionRecord) -> Result<(), AuditError> {
        let blob = serde_json::to_string(record)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(record.access_time_ms())
            .arg(blob)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))
    }

    async fn find_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError> {
        let mut records = self.all_records().await?;
        records.reverse();
        records.retain(|record| record.client_ip == ip);
        records.truncate(limit);
        Ok(records)
    }

    async fn count(&self) -> Result<u64, AuditError> {
        let mut conn = self.connection().await?;
        redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))
    }

    async fn find_ddos(&self, limit: usize) -> Result<Vec<AdmissionRecord>, AuditError> {
        let mut records = self.all_records().await?;
        records.reverse();
        records.retain(|record| record.is_ddos_related());
        records.truncate(limit);
        Ok(records)
    }

    async fn evict_older_than(&self, cutoff_ms: i64) -> Result<u64, AuditError> {
        let mut conn = self.connection().await?;
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(format!("({}", cutoff_ms))
            .query_async(&mut conn)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))
    }
}

/// Non-blocking producer handle for the audit pipeline.
#[derive(Clone)]
pub struct AuditSink {
    sender: mpsc::Sender<AdmissionRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Spawn the writer task and hand back the producer handle.
    pub fn start(store: Arc<dyn AuditStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<AdmissionRecord>(capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(err) = store.append(&record).await {
                    error!(
                        "audit write failed - IP: {}, path: {}, error: {}",
                        record.client_ip, record.request_path, err
                    );
                }
            }
            debug!("audit writer stopped");
        });

        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            writer,
        )
    }

    /// Enqueue without blocking; drops and counts when the queue is full.
    pub fn enqueue(&self, record: AdmissionRecord) {
        if let Err(err) = self.sender.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("audit queue full, dropping record ({} dropped so far): {}", dropped, err);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(ip: &str, limit_type: Option<&str>, age_days: i64) -> AdmissionRecord {
        AdmissionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            client_ip: ip.to_string(),
            request_path: "/a".to_string(),
            http_method: "GET".to_string(),
            user_agent: Some("Mozilla/5.0".to_string()),
            request_headers: HashMap::new(),
            response_status: Some(200),
            processing_time_ms: 3,
            rate_limited: limit_type.is_some(),
            rate_limit_type: limit_type.map(|t| t.to_string()),
            in_whitelist: false,
            trace_id: "trace".to_string(),
            access_time: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    #[test]
    fn sensitive_headers_are_filtered() {
        let mut headers = HashMap::new();
        headers.insert("accept".to_string(), "text/html".to_string());
        headers.insert("authorization".to_string(), "Bearer secret".to_string());
        headers.insert("cookie".to_string(), "session=1".to_string());
        headers.insert("x-api-token".to_string(), "t".to_string());
        headers.insert("x-password-hint".to_string(), "p".to_string());

        let filtered = filter_sensitive_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("accept"));
    }

    #[tokio::test]
    async fn memory_store_queries_filter_and_order() {
        let store = MemoryAuditStore::new();
        store.append(&record("1.1.1.1", None, 0)).await.unwrap();
        store.append(&record("1.1.1.1", Some("SECOND_LIMIT"), 0)).await.unwrap();
        store.append(&record("2.2.2.2", Some("DDOS_THRESHOLD"), 0)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.find_by_ip("1.1.1.1", 10).await.unwrap().len(), 2);

        let ddos = store.find_ddos(10).await.unwrap();
        assert_eq!(ddos.len(), 1);
        assert_eq!(ddos[0].client_ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn retention_evicts_only_old_records() {
        let store = MemoryAuditStore::new();
        store.append(&record("1.1.1.1", None, 40)).await.unwrap();
        store.append(&record("1.1.1.1", None, 0)).await.unwrap();

        let cutoff = (Utc::now() - ChronoDuration::days(30)).timestamp_millis();
        let evicted = store.evict_older_than(cutoff).await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sink_persists_through_the_writer() {
        let store = Arc::new(MemoryAuditStore::new());
        let (sink, writer) = AuditSink::start(store.clone(), 16);

        sink.enqueue(record("3.3.3.3", None, 0));
        drop(sink);
        writer.await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // The receiver is held but never drained, so the second enqueue
        // finds the queue full.
        let (sender, _receiver) = mpsc::channel::<AdmissionRecord>(1);
        let sink = AuditSink {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };

        sink.enqueue(record("4.4.4.4", None, 0));
        sink.enqueue(record("4.4.4.4", None, 0));
        assert_eq!(sink.dropped_count(), 1);
    }
}
