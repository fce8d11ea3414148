//! One persistence attempt for a batch of field deltas.
//!
//! Routing:
//! - offline (connectivity signal, or the store says the network is gone)
//!   → one [`QueuedSave`](crate::queue::QueuedSave) per delta, `Offline`
//! - share scope → [`DocumentStore::update_shared`]
//! - [`ConcurrencyMode::LastWriteWins`] → [`DocumentStore::update`]
//! - [`ConcurrencyMode::Conditional`] → [`DocumentStore::update_if_version`];
//!   a mismatch is resolved against a fresh read
//!
//! The executor never touches local version state on failure. On success
//! the caller hands the result to [`SaveExecutor::commit`].

use std::sync::Arc;

use backline_core::{
    deltas_to_fields, DocumentConflict, DocumentId, DocumentType, DocumentUpdate, FieldDelta,
    FieldMap, ShareScope, UserId, UPDATED_AT_FIELD,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ConcurrencyMode;
use crate::connectivity::Connectivity;
use crate::detector::ChangeDetector;
use crate::error::{SaveError, SaveErrorKind};
use crate::queue::OfflineQueue;
use crate::retry;
use crate::store::{DocumentStore, StoreError, StoreWrite};

#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub document_id: DocumentId,
    pub document_type: DocumentType,
    pub author: UserId,
    pub deltas: Vec<FieldDelta>,
    /// Version the author saw when the edit burst began.
    pub expected_version: u64,
    pub scope: Option<ShareScope>,
    pub created_at: DateTime<Utc>,
}

impl SaveRequest {
    pub fn new(
        document_id: DocumentId,
        document_type: DocumentType,
        author: UserId,
        deltas: Vec<FieldDelta>,
        expected_version: u64,
    ) -> Self {
        Self {
            document_id,
            document_type,
            author,
            deltas,
            expected_version,
            scope: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_scope(mut self, scope: Option<ShareScope>) -> Self {
        self.scope = scope;
        self
    }

    /// Changed fields plus the last-modified stamp, as one write.
    pub fn fields(&self) -> FieldMap {
        let mut fields = deltas_to_fields(&self.deltas);
        fields.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        fields
    }

    pub fn to_updates(&self) -> Vec<DocumentUpdate> {
        self.deltas
            .iter()
            .map(|delta| {
                DocumentUpdate::from_delta(
                    self.document_id,
                    self.document_type,
                    self.author,
                    delta,
                    self.expected_version,
                    self.scope.clone(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveResult {
    Saved {
        version: u64,
        saved_at: DateTime<Utc>,
    },
    /// Not attempted; `queued` entries went to the offline queue.
    Offline { queued: usize },
    Failed { error: SaveError },
    /// Nothing was written; the store holds newer values for these fields.
    Conflict(Vec<DocumentConflict>),
}

impl SaveResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SaveResult::Saved { .. })
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            SaveResult::Saved { version, .. } => Some(*version),
            _ => None,
        }
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SaveResult::Saved { saved_at, .. } => Some(*saved_at),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            SaveResult::Failed { error } => Some(&error.message),
            _ => None,
        }
    }

    pub fn conflicts(&self) -> &[DocumentConflict] {
        match self {
            SaveResult::Conflict(conflicts) => conflicts,
            _ => &[],
        }
    }

    fn from_write(write: StoreWrite) -> Self {
        SaveResult::Saved {
            version: write.version,
            saved_at: write.updated_at,
        }
    }
}

pub struct SaveExecutor {
    store: Arc<dyn DocumentStore>,
    queue: Option<Arc<OfflineQueue>>,
    connectivity: Connectivity,
    mode: ConcurrencyMode,
}

impl SaveExecutor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Option<Arc<OfflineQueue>>,
        connectivity: Connectivity,
        mode: ConcurrencyMode,
    ) -> Self {
        Self {
            store,
            queue,
            connectivity,
            mode,
        }
    }

    pub async fn save(&self, request: &SaveRequest) -> SaveResult {
        if request.deltas.is_empty() {
            return SaveResult::Failed {
                error: SaveError::new(SaveErrorKind::Rejected, "nothing to save"),
            };
        }
        if !self.connectivity.is_online() {
            return self.divert(request);
        }

        match self.write(request).await {
            Ok(write) => SaveResult::from_write(write),
            Err(StoreError::Unavailable(reason)) => {
                log::info!("store unreachable ({reason}), queueing {}", request.document_id);
                self.divert(request)
            }
            Err(StoreError::VersionMismatch { actual, .. }) => {
                self.resolve_mismatch(request, actual).await
            }
            Err(e) => SaveResult::Failed {
                error: SaveError::from(&e),
            },
        }
    }

    /// One raw write with no routing.
    pub async fn write(&self, request: &SaveRequest) -> Result<StoreWrite, StoreError> {
        let fields = request.fields();
        match (&request.scope, self.mode) {
            (Some(scope), _) => {
                self.store
                    .update_shared(scope, request.document_type, request.document_id, fields)
                    .await
            }
            (None, ConcurrencyMode::LastWriteWins) => {
                self.store
                    .update(request.document_type, request.document_id, fields)
                    .await
            }
            (None, ConcurrencyMode::Conditional) => {
                self.store
                    .update_if_version(
                        request.document_type,
                        request.document_id,
                        request.expected_version,
                        fields,
                    )
                    .await
            }
        }
    }

    /// Conditional write lost the race. Surface real field conflicts; if
    /// the newer writes touched other fields, write again on top of them.
    async fn resolve_mismatch(&self, request: &SaveRequest, actual: u64) -> SaveResult {
        let check = match retry::precheck(self.store.as_ref(), request).await {
            Ok(check) => check,
            Err(e) => {
                return SaveResult::Failed {
                    error: SaveError::new(SaveErrorKind::VersionConflict, e.to_string()),
                }
            }
        };
        if !check.conflicts.is_empty() {
            log::warn!(
                "{} conflicting field(s) on {} (stored v{})",
                check.conflicts.len(),
                request.document_id,
                check.stored.version
            );
            return SaveResult::Conflict(check.conflicts);
        }

        let rebased = SaveRequest {
            expected_version: actual.max(check.stored.version),
            ..request.clone()
        };
        match self.write(&rebased).await {
            Ok(write) => SaveResult::from_write(write),
            Err(e) => SaveResult::Failed {
                error: SaveError::from(&e),
            },
        }
    }

    /// Queue every delta of `request` for later replay.
    pub fn divert(&self, request: &SaveRequest) -> SaveResult {
        let Some(queue) = &self.queue else {
            return SaveResult::Failed {
                error: SaveError::new(SaveErrorKind::NetworkUnavailable, "offline"),
            };
        };

        let mut queued = 0;
        for update in request.to_updates() {
            match queue.enqueue(update) {
                Ok(_) => queued += 1,
                Err(e) => {
                    log::error!("failed to queue offline save: {e}");
                    return SaveResult::Failed {
                        error: SaveError::new(SaveErrorKind::Transient, e.to_string()),
                    };
                }
            }
        }
        SaveResult::Offline { queued }
    }

    /// Advance the detector after a successful save.
    pub fn commit(&self, detector: &mut ChangeDetector, request: &SaveRequest, result: &SaveResult) {
        if let SaveResult::Saved { version, saved_at } = result {
            detector.commit(&request.deltas, *version, *saved_at);
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn queue(&self) -> Option<&Arc<OfflineQueue>> {
        self.queue.as_ref()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::store::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        store: MemoryStore,
        doc: DocumentId,
        connectivity: Connectivity,
        queue: Arc<OfflineQueue>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(version: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let queue =
            Arc::new(OfflineQueue::open(QueueConfig::for_testing(dir.path().join("q"))).unwrap());
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        let mut fields = FieldMap::new();
        fields.insert("title".into(), json!("Main Stage"));
        store.seed(DocumentType::StagePlot, doc, version, fields).await;
        Fixture {
            store,
            doc,
            connectivity: Connectivity::online(),
            queue,
            _dir: dir,
        }
    }

    fn executor(f: &Fixture, mode: ConcurrencyMode) -> SaveExecutor {
        SaveExecutor::new(
            Arc::new(f.store.clone()),
            Some(f.queue.clone()),
            f.connectivity.clone(),
            mode,
        )
    }

    fn request(f: &Fixture, field: &str, value: Value, previous: Value, expected: u64) -> SaveRequest {
        SaveRequest::new(
            f.doc,
            DocumentType::StagePlot,
            Uuid::new_v4(),
            vec![FieldDelta::new(field, value, Some(previous))],
            expected,
        )
    }

    #[tokio::test]
    async fn test_saved_reports_store_version() {
        let f = fixture(5).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        let req = request(&f, "title", json!("Side"), json!("Main Stage"), 5);

        let result = exec.save(&req).await;
        assert!(result.is_success());
        assert_eq!(result.version(), Some(6));

        let row = f.store.read(DocumentType::StagePlot, f.doc).await.unwrap();
        assert_eq!(row.fields["title"], json!("Side"));
        assert_eq!(row.fields[UPDATED_AT_FIELD], json!(row.updated_at.to_rfc3339()));
    }

    #[tokio::test]
    async fn test_offline_queues_one_entry_per_delta() {
        let f = fixture(1).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        f.connectivity.set_online(false);

        let mut req = request(&f, "title", json!("A"), json!("Main Stage"), 1);
        req.deltas.push(FieldDelta::new("notes", json!("B"), None));

        assert_eq!(exec.save(&req).await, SaveResult::Offline { queued: 2 });
        assert_eq!(f.queue.len().unwrap(), 2);
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_store_unreachable_diverts() {
        let f = fixture(1).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        f.store.set_offline(true);

        let req = request(&f, "title", json!("A"), json!("Main Stage"), 1);
        assert_eq!(exec.save(&req).await, SaveResult::Offline { queued: 1 });
    }

    #[tokio::test]
    async fn test_transient_failure_is_classified() {
        let f = fixture(1).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        f.store.fail_next(1);

        let req = request(&f, "title", json!("A"), json!("Main Stage"), 1);
        let result = exec.save(&req).await;
        match &result {
            SaveResult::Failed { error } => assert_eq!(error.kind, SaveErrorKind::Transient),
            other => panic!("unexpected {other:?}"),
        }
        assert!(result.error_message().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_scoped_save_uses_share_path() {
        let f = fixture(1).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        let scope = ShareScope::new("link-123");

        let req = request(&f, "title", json!("A"), json!("Main Stage"), 1)
            .with_scope(Some(scope.clone()));
        let result = exec.save(&req).await;
        assert!(matches!(result, SaveResult::Failed { ref error } if error.kind == SaveErrorKind::Rejected));

        f.store.grant_scope(&scope, f.doc).await;
        assert_eq!(exec.save(&req).await.version(), Some(2));
    }

    #[tokio::test]
    async fn test_conditional_conflict() {
        let f = fixture(5).await;
        let exec = executor(&f, ConcurrencyMode::Conditional);

        // Someone else wrote the same field at v6.
        let mut other = FieldMap::new();
        other.insert("title".into(), json!("Theirs"));
        f.store.update(DocumentType::StagePlot, f.doc, other).await.unwrap();

        let req = request(&f, "title", json!("Mine"), json!("Main Stage"), 5);
        let result = exec.save(&req).await;
        let conflicts = result.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].remote.value, json!("Theirs"));
        assert_eq!(conflicts[0].local.value, json!("Mine"));
        assert_eq!(conflicts[0].remote.version, Some(6));
    }

    #[tokio::test]
    async fn test_conditional_rebases_disjoint_fields() {
        let f = fixture(5).await;
        let exec = executor(&f, ConcurrencyMode::Conditional);

        let mut other = FieldMap::new();
        other.insert("notes".into(), json!("Theirs"));
        f.store.update(DocumentType::StagePlot, f.doc, other).await.unwrap();

        let req = request(&f, "title", json!("Mine"), json!("Main Stage"), 5);
        assert_eq!(exec.save(&req).await.version(), Some(7));
    }

    #[tokio::test]
    async fn test_commit_only_on_success() {
        let f = fixture(5).await;
        let exec = executor(&f, ConcurrencyMode::LastWriteWins);
        let mut initial = FieldMap::new();
        initial.insert("title".into(), json!("Main Stage"));
        let mut detector = ChangeDetector::new(initial, 5);
        let deltas = detector.edit("title", json!("Side"));
        let req = SaveRequest::new(f.doc, DocumentType::StagePlot, Uuid::new_v4(), deltas, 5);

        let failed = SaveResult::Failed {
            error: SaveError::new(SaveErrorKind::Transient, "x"),
        };
        exec.commit(&mut detector, &req, &failed);
        assert!(detector.has_pending());
        assert_eq!(detector.observed_version(), 5);

        let result = exec.save(&req).await;
        exec.commit(&mut detector, &req, &result);
        assert!(!detector.has_pending());
        assert_eq!(detector.observed_version(), 6);
    }
}
