//! Durable document store and change-stream interfaces.
//!
//! The real backing store is an external relational table keyed by document
//! id with a store-maintained `version` column. The engine only speaks the
//! [`DocumentStore`] and [`ChangeStream`] traits; [`MemoryStore`] implements
//! both in-process for tests and local use, with fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backline_core::{DocumentId, DocumentType, FieldMap, ShareScope, UPDATED_AT_FIELD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("store error: {0}")]
    Backend(String),
}

/// What the store reports back for an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreWrite {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// A row as the store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub fields: FieldMap,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write `fields` in one atomic update. The store bumps `version`.
    async fn update(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError>;

    /// Write through a share-link scope instead of per-user ownership.
    async fn update_shared(
        &self,
        scope: &ShareScope,
        doc_type: DocumentType,
        doc_id: DocumentId,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError>;

    /// Write only if the stored version still equals `expected`.
    async fn update_if_version(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        expected: u64,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError>;

    async fn read(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
    ) -> Result<StoredDocument, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowEvent {
    Insert,
    Update,
    Delete,
    All,
}

impl RowEvent {
    fn matches(&self, other: RowEvent) -> bool {
        *self == RowEvent::All || *self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowFilter {
    All,
    Id(DocumentId),
}

impl RowFilter {
    fn matches(&self, id: DocumentId) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Id(want) => *want == id,
        }
    }
}

/// One row-level change delivered by a [`ChangeStream`] subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub event: RowEvent,
    pub old: Option<StoredDocument>,
    pub new: Option<StoredDocument>,
}

#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Subscribe to row changes. The receiver closes when the subscription
    /// is lost; the caller is expected to resubscribe.
    async fn subscribe(
        &self,
        table: &str,
        event: RowEvent,
        filter: RowFilter,
    ) -> Result<mpsc::Receiver<RowChange>, StoreError>;
}

struct Subscriber {
    table: String,
    event: RowEvent,
    filter: RowFilter,
    tx: mpsc::Sender<RowChange>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<(DocumentType, DocumentId), StoredDocument>,
    scopes: HashMap<String, DocumentId>,
    subscribers: Vec<Subscriber>,
}

/// In-process store with a trigger-style version column.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    offline: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            offline: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicU32::new(0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Insert (or overwrite) a row at an explicit version.
    pub async fn seed(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        version: u64,
        fields: FieldMap,
    ) -> StoredDocument {
        let row = StoredDocument {
            id: doc_id,
            version,
            updated_at: Utc::now(),
            fields,
        };
        let mut tables = self.tables.lock().await;
        tables.rows.insert((doc_type, doc_id), row.clone());
        notify(&mut tables, doc_type, RowEvent::Insert, None, Some(row.clone()));
        row
    }

    /// Allow writes through `scope` to `doc_id`.
    pub async fn grant_scope(&self, scope: &ShareScope, doc_id: DocumentId) {
        self.tables
            .lock()
            .await
            .scopes
            .insert(scope.token.clone(), doc_id);
    }

    /// Simulate losing the network: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient backend error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of accepted writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Drop every change-stream subscription, as a server restart would.
    pub async fn drop_subscriptions(&self) -> usize {
        let mut tables = self.tables.lock().await;
        let dropped = tables.subscribers.len();
        tables.subscribers.clear();
        dropped
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("network unreachable".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Backend("503 service unavailable".into()));
        }
        Ok(())
    }

    async fn apply(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        expected: Option<u64>,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .rows
            .get_mut(&(doc_type, doc_id))
            .ok_or(StoreError::NotFound(doc_id))?;

        if let Some(expected) = expected {
            if row.version != expected {
                return Err(StoreError::VersionMismatch {
                    expected,
                    actual: row.version,
                });
            }
        }

        let old = row.clone();
        let updated_at = Utc::now();
        row.fields.extend(fields);
        row.fields
            .insert(UPDATED_AT_FIELD.to_string(), Value::String(updated_at.to_rfc3339()));
        row.version += 1;
        row.updated_at = updated_at;
        let new = row.clone();

        let write = StoreWrite {
            version: new.version,
            updated_at,
        };
        notify(&mut tables, doc_type, RowEvent::Update, Some(old), Some(new));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(write)
    }
}

fn notify(
    tables: &mut Tables,
    doc_type: DocumentType,
    event: RowEvent,
    old: Option<StoredDocument>,
    new: Option<StoredDocument>,
) {
    let Some(id) = new.as_ref().or(old.as_ref()).map(|row| row.id) else {
        return;
    };
    let change = RowChange {
        table: doc_type.table().to_string(),
        event,
        old,
        new,
    };
    tables.subscribers.retain(|sub| {
        if sub.tx.is_closed() {
            return false;
        }
        if sub.table == change.table && sub.event.matches(event) && sub.filter.matches(id) {
            if sub.tx.try_send(change.clone()).is_err() {
                log::warn!("change stream subscriber lagging, dropped {event:?} for {id}");
            }
        }
        true
    });
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn update(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError> {
        self.gate().await?;
        self.apply(doc_type, doc_id, None, fields).await
    }

    async fn update_shared(
        &self,
        scope: &ShareScope,
        doc_type: DocumentType,
        doc_id: DocumentId,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError> {
        self.gate().await?;
        let granted = self.tables.lock().await.scopes.get(&scope.token).copied();
        if granted != Some(doc_id) {
            return Err(StoreError::Rejected(format!(
                "share scope does not grant access to {doc_id}"
            )));
        }
        self.apply(doc_type, doc_id, None, fields).await
    }

    async fn update_if_version(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
        expected: u64,
        fields: FieldMap,
    ) -> Result<StoreWrite, StoreError> {
        self.gate().await?;
        self.apply(doc_type, doc_id, Some(expected), fields).await
    }

    async fn read(
        &self,
        doc_type: DocumentType,
        doc_id: DocumentId,
    ) -> Result<StoredDocument, StoreError> {
        self.gate().await?;
        self.tables
            .lock()
            .await
            .rows
            .get(&(doc_type, doc_id))
            .cloned()
            .ok_or(StoreError::NotFound(doc_id))
    }
}

#[async_trait]
impl ChangeStream for MemoryStore {
    async fn subscribe(
        &self,
        table: &str,
        event: RowEvent,
        filter: RowFilter,
    ) -> Result<mpsc::Receiver<RowChange>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("network unreachable".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.tables.lock().await.subscribers.push(Subscriber {
            table: table.to_string(),
            event,
            filter,
            tx,
        });
        Ok(rx)
    }
}
