//! Retry with exponential backoff, pre-write conflict checks and offline
//! queue replay.
//!
//! ```text
//! failed save ──► wait base·2^(n-1) ──► read store ──┬─ newer value ──► Conflict
//!                         ▲                          ├─ offline ──────► queue
//!                         │                          └─ write ─┬─ ok ──► Saved, dequeue
//!                         └──── transient (n < max) ◄──────────┘
//! ```
//!
//! Exhausting the budget is terminal: the error is surfaced and any queue
//! entries behind the request are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backline_core::{ConflictSide, DocumentConflict, DocumentId, FieldDelta};
use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::detector::ChangeDetector;
use crate::error::{SaveError, SaveErrorKind};
use crate::executor::{SaveExecutor, SaveRequest, SaveResult};
use crate::queue::QueuedSave;
use crate::store::{DocumentStore, StoreError, StoredDocument};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// What a fresh read says about a pending request.
#[derive(Debug, Clone)]
pub struct PreCheck {
    pub stored: StoredDocument,
    pub conflicts: Vec<DocumentConflict>,
    /// Every field already holds the requested value.
    pub already_applied: bool,
}

/// Compare `request` with the stored row.
///
/// A field conflicts when the store moved past the expected version and
/// holds a value that is neither the author's starting point nor the value
/// being written.
pub async fn precheck(
    store: &dyn DocumentStore,
    request: &SaveRequest,
) -> Result<PreCheck, StoreError> {
    let stored = store
        .read(request.document_type, request.document_id)
        .await?;

    let mut conflicts = Vec::new();
    let mut already_applied = true;
    for delta in &request.deltas {
        let current = stored.fields.get(&delta.field);
        if current != Some(&delta.value) {
            already_applied = false;
        }
        if stored.version <= request.expected_version {
            continue;
        }
        let Some(current) = current else {
            continue;
        };
        if current != &delta.value && Some(current) != delta.previous.as_ref() {
            conflicts.push(DocumentConflict::new(
                request.document_id,
                delta.field.clone(),
                ConflictSide {
                    value: delta.value.clone(),
                    timestamp: request.created_at,
                    version: None,
                },
                ConflictSide {
                    value: current.clone(),
                    timestamp: stored.updated_at,
                    version: Some(stored.version),
                },
            ));
        }
    }

    Ok(PreCheck {
        stored,
        conflicts,
        already_applied,
    })
}

/// Post-write check for last-write-wins saves.
///
/// If the store returned a version more than one past the expectation, some
/// other write landed in between. Any field for which a different remote
/// value was observed at such a version was silently overwritten.
pub fn detect_lost_updates(
    detector: &ChangeDetector,
    request: &SaveRequest,
    returned_version: u64,
) -> Vec<DocumentConflict> {
    if returned_version <= request.expected_version.saturating_add(1) {
        return Vec::new();
    }
    request
        .deltas
        .iter()
        .filter_map(|delta| {
            let seen = detector.remote_observation(&delta.field)?;
            let after_expected = seen.version.map_or(true, |v| v > request.expected_version);
            if !after_expected || seen.value == delta.value {
                return None;
            }
            Some(DocumentConflict::new(
                request.document_id,
                delta.field.clone(),
                ConflictSide {
                    value: delta.value.clone(),
                    timestamp: request.created_at,
                    version: Some(returned_version),
                },
                ConflictSide {
                    value: seen.value.clone(),
                    timestamp: seen.observed_at,
                    version: seen.version,
                },
            ))
        })
        .collect()
}

enum Step {
    Done(SaveResult),
    Retry(SaveError),
}

pub struct RetryController {
    executor: Arc<SaveExecutor>,
    policy: RetryPolicy,
    conflict_check: bool,
}

impl RetryController {
    pub fn new(executor: Arc<SaveExecutor>, config: &RetryConfig) -> Self {
        Self {
            executor,
            policy: RetryPolicy::from(config),
            conflict_check: config.conflict_check,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry a request whose first write failed with a transient error.
    ///
    /// `queued` are the queue entries the request replays; they are removed
    /// on success and on terminal failure.
    pub async fn run(&self, request: &SaveRequest, queued: &[Uuid]) -> SaveResult {
        self.run_from(request, queued, 1, None).await
    }

    /// [`run`](Self::run) with attempts `first..=max_attempts` left in the
    /// budget.
    async fn run_from(
        &self,
        request: &SaveRequest,
        queued: &[Uuid],
        first: u32,
        mut last_error: Option<SaveError>,
    ) -> SaveResult {
        for attempt in first..=self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            log::debug!(
                "retrying save of {} in {delay:?} (attempt {attempt}/{})",
                request.document_id,
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;

            match self.attempt(request, queued, attempt).await {
                Step::Done(result) => return result,
                Step::Retry(error) => last_error = Some(error),
            }
        }

        let error = last_error
            .unwrap_or_else(|| SaveError::new(SaveErrorKind::Transient, "retry budget is zero"));
        log::error!(
            "giving up on {} after {} attempts: {}",
            request.document_id,
            self.policy.max_attempts,
            error.message
        );
        self.forget(queued);
        SaveResult::Failed { error }
    }

    /// Replay everything queued for `doc_id` as one write.
    ///
    /// Returns `None` when nothing is queued.
    pub async fn drain(&self, doc_id: DocumentId) -> Option<(SaveRequest, SaveResult)> {
        let queue = self.executor.queue()?;
        match queue.list_for_document(doc_id) {
            Ok(entries) => self.replay(entries).await,
            Err(e) => {
                log::error!("failed to read offline queue: {e}");
                None
            }
        }
    }

    /// Replay `entries` (one document, FIFO) as one write.
    pub async fn replay(&self, entries: Vec<QueuedSave>) -> Option<(SaveRequest, SaveResult)> {
        let (request, ids, attempts) = fold_entries(&entries)?;
        log::info!(
            "replaying {} queued save(s) for {} ({} field(s))",
            ids.len(),
            request.document_id,
            request.deltas.len()
        );

        if attempts >= self.policy.max_attempts {
            self.forget(&ids);
            let error = SaveError::new(
                SaveErrorKind::Transient,
                format!("queued save exhausted {attempts} attempts"),
            );
            return Some((request, SaveResult::Failed { error }));
        }

        let result = match self.attempt(&request, &ids, attempts + 1).await {
            Step::Done(result) => result,
            Step::Retry(error) => {
                self.run_from(&request, &ids, attempts + 2, Some(error))
                    .await
            }
        };
        Some((request, result))
    }

    async fn attempt(&self, request: &SaveRequest, queued: &[Uuid], attempt: u32) -> Step {
        if !self.executor.connectivity().is_online() {
            return Step::Done(self.go_offline(request, queued));
        }

        if self.conflict_check {
            match precheck(self.executor.store().as_ref(), request).await {
                Ok(check) if !check.conflicts.is_empty() => {
                    log::warn!(
                        "pre-write check found {} conflict(s) on {}",
                        check.conflicts.len(),
                        request.document_id
                    );
                    self.forget(queued);
                    return Step::Done(SaveResult::Conflict(check.conflicts));
                }
                Ok(check) if check.already_applied && !queued.is_empty() => {
                    log::debug!("queued save for {} already applied", request.document_id);
                    self.forget(queued);
                    return Step::Done(SaveResult::Saved {
                        version: check.stored.version,
                        saved_at: check.stored.updated_at,
                    });
                }
                Ok(_) => {}
                Err(StoreError::Unavailable(_)) => {
                    return Step::Done(self.go_offline(request, queued));
                }
                Err(e) => return self.failed(&e, queued, attempt),
            }
        }

        match self.executor.write(request).await {
            Ok(write) => {
                self.forget(queued);
                Step::Done(SaveResult::Saved {
                    version: write.version,
                    saved_at: write.updated_at,
                })
            }
            Err(StoreError::Unavailable(_)) => Step::Done(self.go_offline(request, queued)),
            Err(e) => self.failed(&e, queued, attempt),
        }
    }

    fn failed(&self, err: &StoreError, queued: &[Uuid], attempt: u32) -> Step {
        let error = SaveError::from(err);
        if !error.kind.is_retryable() {
            self.forget(queued);
            return Step::Done(SaveResult::Failed { error });
        }
        if let Some(queue) = self.executor.queue() {
            for id in queued {
                if let Err(e) = queue.update_attempt(*id, attempt, Some(error.message.clone())) {
                    log::warn!("failed to record attempt for queued save {id}: {e}");
                }
            }
        }
        Step::Retry(error)
    }

    /// Connectivity dropped mid-retry. Entries already in the queue stay
    /// there; a fresh request is diverted.
    fn go_offline(&self, request: &SaveRequest, queued: &[Uuid]) -> SaveResult {
        if queued.is_empty() {
            self.executor.divert(request)
        } else {
            SaveResult::Offline {
                queued: queued.len(),
            }
        }
    }

    fn forget(&self, queued: &[Uuid]) {
        let Some(queue) = self.executor.queue() else {
            return;
        };
        for id in queued {
            if let Err(e) = queue.dequeue(*id) {
                log::warn!("failed to dequeue {id}: {e}");
            }
        }
    }
}

/// Fold queue entries (FIFO) into one request. Later values win per
/// field; the earliest `previous` and expected version are kept.
fn fold_entries(entries: &[QueuedSave]) -> Option<(SaveRequest, Vec<Uuid>, u32)> {
    let first = entries.first()?;
    let mut fields: BTreeMap<String, FieldDelta> = BTreeMap::new();
    let mut expected = first.update.expected_version;
    let mut attempts = 0;

    for entry in entries {
        let update = &entry.update;
        expected = expected.min(update.expected_version);
        attempts = attempts.max(entry.attempts);
        fields
            .entry(update.field.clone())
            .and_modify(|delta| delta.value = update.value.clone())
            .or_insert_with(|| update.to_delta());
    }

    let mut request = SaveRequest::new(
        first.update.document_id,
        first.update.document_type,
        first.update.author,
        fields.into_values().collect(),
        expected,
    )
    .with_scope(first.update.scope.clone());
    request.created_at = entries
        .iter()
        .map(|e| e.update.timestamp)
        .max()
        .unwrap_or_else(Utc::now);

    let ids = entries.iter().map(|e| e.id).collect();
    Some((request, ids, attempts))
}
