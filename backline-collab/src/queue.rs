//! Durable offline queue.
//!
//! Writes that could not reach the store are kept here until connectivity
//! returns. Backed by RocksDB so queued edits survive a reload or crash.
//!
//! Column families:
//! - `queue`: `sequence (8 bytes BE)` → LZ4-compressed JSON [`QueuedSave`]
//! - `index`: `queue id (16 bytes)` → sequence key
//!
//! Iterating `queue` yields entries in enqueue order. The sequence counter
//! is recovered from the last key on open.
//!
//! Capacity is bounded: once full, the oldest entry is evicted to make room.
//! Evicted edits are lost, so every eviction is logged at `warn`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use backline_core::{DocumentId, DocumentUpdate};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::QueueConfig;

const CF_QUEUE: &str = "queue";
const CF_INDEX: &str = "index";

const COLUMN_FAMILIES: &[&str] = &[CF_QUEUE, CF_INDEX];

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("queue record encoding failed: {0}")]
    Serialization(String),
    #[error("queue record is corrupt: {0}")]
    Corrupt(String),
    #[error("queued save not found: {0}")]
    NotFound(Uuid),
    #[error("queue lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for QueueError {
    fn from(e: rocksdb::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// A field write waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSave {
    pub id: Uuid,
    pub update: DocumentUpdate,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedSave {
    pub fn new(update: DocumentUpdate) -> Self {
        Self {
            id: Uuid::new_v4(),
            update,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let json =
            serde_json::to_vec(self).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| QueueError::Corrupt(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| QueueError::Corrupt(e.to_string()))
    }
}

pub struct OfflineQueue {
    db: DBWithThreadMode<SingleThreaded>,
    config: QueueConfig,
    sequence: AtomicU64,
    /// Serializes read-modify-write sequences.
    lock: Mutex<()>,
}

impl OfflineQueue {
    /// Open (or create) the queue and drop entries older than the max age.
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Records are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        let queue = Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            lock: Mutex::new(()),
        };

        let pruned = queue.prune(queue.config.max_age())?;
        let remaining = queue.len()?;
        log::info!(
            "offline queue opened at {} ({remaining} pending, {pruned} expired)",
            queue.config.path.display()
        );
        Ok(queue)
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_QUEUE) else {
            return 0;
        };
        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    /// Persist `update`, evicting the oldest entries if the queue is full.
    pub fn enqueue(&self, update: DocumentUpdate) -> Result<Uuid, QueueError> {
        self.insert(QueuedSave::new(update))
    }

    fn insert(&self, entry: QueuedSave) -> Result<Uuid, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;

        self.prune_locked(self.config.max_age())?;

        let mut entries = self.scan()?;
        while entries.len() >= self.config.max_entries {
            let (key, oldest) = entries.remove(0);
            log::warn!(
                "offline queue full ({} entries), evicting {} ({} on {}) queued at {}",
                self.config.max_entries,
                oldest.id,
                oldest.update.field,
                oldest.update.document_id,
                oldest.enqueued_at
            );
            self.delete_locked(&key, oldest.id)?;
        }

        self.append_locked(&entry)?;

        log::debug!(
            "queued {} for {} ({})",
            entry.update.field,
            entry.update.document_id,
            entry.id
        );
        Ok(entry.id)
    }

    fn append_locked(&self, entry: &QueuedSave) -> Result<(), QueueError> {
        let key = self.sequence.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_QUEUE)?, key, entry.encode()?);
        batch.put_cf(self.cf(CF_INDEX)?, entry.id.as_bytes(), key);
        self.write(batch)
    }

    /// Remove an entry. Returns `false` if it was already gone.
    pub fn dequeue(&self, id: Uuid) -> Result<bool, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        match self.db.get_cf(self.cf(CF_INDEX)?, id.as_bytes())? {
            Some(key) => {
                self.delete_locked(&key, id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every entry, oldest first.
    pub fn list_all(&self) -> Result<Vec<QueuedSave>, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(self.scan()?.into_iter().map(|(_, entry)| entry).collect())
    }

    pub fn list_for_document(&self, doc_id: DocumentId) -> Result<Vec<QueuedSave>, QueueError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|entry| entry.update.document_id == doc_id)
            .collect())
    }

    /// Record a failed replay attempt.
    pub fn update_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        let key = self
            .db
            .get_cf(self.cf(CF_INDEX)?, id.as_bytes())?
            .ok_or(QueueError::NotFound(id))?;
        let bytes = self
            .db
            .get_cf(self.cf(CF_QUEUE)?, &key)?
            .ok_or(QueueError::NotFound(id))?;

        let mut entry = QueuedSave::decode(&bytes)?;
        entry.attempts = attempts;
        entry.last_attempt_at = Some(Utc::now());
        entry.update.retry_count = Some(attempts);
        if let Some(error) = error {
            entry.update.last_error = Some(error.clone());
            entry.last_error = Some(error);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_QUEUE)?, &key, entry.encode()?);
        self.write(batch)
    }

    /// Drop entries enqueued more than `max_age` ago.
    pub fn prune(&self, max_age: Duration) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        self.prune_locked(max_age)
    }

    fn prune_locked(&self, max_age: Duration) -> Result<usize, QueueError> {
        let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (key, entry) in self.scan()? {
            if entry.enqueued_at < cutoff {
                log::info!(
                    "pruning expired queued save {} ({} on {})",
                    entry.id,
                    entry.update.field,
                    entry.update.document_id
                );
                self.delete_locked(&key, entry.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop every entry for `doc_id`.
    pub fn clear_for_document(&self, doc_id: DocumentId) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        let mut removed = 0;
        for (key, entry) in self.scan()? {
            if entry.update.document_id == doc_id {
                self.delete_locked(&key, entry.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        let _guard = self.lock.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(self
            .db
            .iterator_cf(self.cf(CF_QUEUE)?, IteratorMode::Start)
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, id: Uuid) -> Result<bool, QueueError> {
        Ok(self.db.get_cf(self.cf(CF_INDEX)?, id.as_bytes())?.is_some())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Decoded entries, oldest first. Undecodable records are dropped.
    fn scan(&self) -> Result<Vec<(Vec<u8>, QueuedSave)>, QueueError> {
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_QUEUE)?, IteratorMode::Start) {
            let (key, value) = item?;
            match QueuedSave::decode(&value) {
                Ok(entry) => entries.push((key.to_vec(), entry)),
                Err(e) => {
                    log::warn!("dropping corrupt queue record at key {:02x?}: {e}", &key[..]);
                    corrupt.push(key.to_vec());
                }
            }
        }
        if !corrupt.is_empty() {
            self.drop_records(&corrupt)?;
        }
        Ok(entries)
    }

    /// Delete raw records and any index entries that point at them.
    fn drop_records(&self, keys: &[Vec<u8>]) -> Result<(), QueueError> {
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(self.cf(CF_QUEUE)?, key);
        }
        for item in self.db.iterator_cf(self.cf(CF_INDEX)?, IteratorMode::Start) {
            let (id, key) = item?;
            if keys.iter().any(|k| k[..] == key[..]) {
                batch.delete_cf(self.cf(CF_INDEX)?, id);
            }
        }
        self.write(batch)
    }

    fn delete_locked(&self, key: &[u8], id: Uuid) -> Result<(), QueueError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_QUEUE)?, key);
        batch.delete_cf(self.cf(CF_INDEX)?, id.as_bytes());
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), QueueError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, QueueError> {
        self.db
            .cf_handle(name)
            .ok_or(QueueError::MissingColumnFamily(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backline_core::{DocumentType, FieldDelta};
    use serde_json::json;
    use tempfile::TempDir;

    fn update(doc: DocumentId, field: &str, value: serde_json::Value) -> DocumentUpdate {
        DocumentUpdate::from_delta(
            doc,
            DocumentType::PatchSheet,
            Uuid::new_v4(),
            &FieldDelta::new(field, value, None),
            1,
            None,
        )
    }

    fn open(dir: &TempDir) -> OfflineQueue {
        OfflineQueue::open(QueueConfig::for_testing(dir.path().join("queue"))).unwrap()
    }

    #[test]
    fn test_enqueue_dequeue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let doc = Uuid::new_v4();

        let id = queue.enqueue(update(doc, "title", json!("FOH"))).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert!(queue.contains(id).unwrap());

        assert!(queue.dequeue(id).unwrap());
        assert!(!queue.dequeue(id).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let doc = Uuid::new_v4();
        for i in 0..5 {
            queue.enqueue(update(doc, "n", json!(i))).unwrap();
        }
        let values: Vec<_> = queue
            .list_all()
            .unwrap()
            .into_iter()
            .map(|e| e.update.value)
            .collect();
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let doc = Uuid::new_v4();
        let capacity = queue.config().max_entries;

        let first = queue.enqueue(update(doc, "n", json!(0))).unwrap();
        for i in 1..=capacity {
            queue.enqueue(update(doc, "n", json!(i))).unwrap();
        }

        assert_eq!(queue.len().unwrap(), capacity);
        assert!(!queue.contains(first).unwrap());
        let entries = queue.list_all().unwrap();
        assert_eq!(entries[0].update.value, json!(1));
    }

    #[test]
    fn test_prune_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let doc = Uuid::new_v4();

        let mut stale = QueuedSave::new(update(doc, "old", json!(1)));
        stale.enqueued_at = Utc::now() - chrono::Duration::hours(25);
        let mut recent = QueuedSave::new(update(doc, "new", json!(2)));
        recent.enqueued_at = Utc::now() - chrono::Duration::hours(23);

        {
            // Straight to disk, skipping the sweep in enqueue.
            let _guard = queue.lock.lock().unwrap();
            queue.append_locked(&stale).unwrap();
            queue.append_locked(&recent).unwrap();
        }
        let stale_id = stale.id;
        assert_eq!(queue.len().unwrap(), 2);

        assert_eq!(queue.prune(Duration::from_secs(24 * 3600)).unwrap(), 1);
        assert!(!queue.contains(stale_id).unwrap());
        assert!(queue.contains(recent.id).unwrap());
    }

    #[test]
    fn test_update_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let id = queue
            .enqueue(update(Uuid::new_v4(), "title", json!("x")))
            .unwrap();

        queue
            .update_attempt(id, 2, Some("503 service unavailable".into()))
            .unwrap();
        let entry = &queue.list_all().unwrap()[0];
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.update.retry_count, Some(2));
        assert_eq!(entry.last_error.as_deref(), Some("503 service unavailable"));
        assert!(entry.last_attempt_at.is_some());

        let missing = queue.update_attempt(Uuid::new_v4(), 1, None);
        assert!(matches!(missing, Err(QueueError::NotFound(_))));
    }

    #[test]
    fn test_per_document_views() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(update(a, "x", json!(1))).unwrap();
        queue.enqueue(update(b, "x", json!(2))).unwrap();
        queue.enqueue(update(a, "y", json!(3))).unwrap();

        assert_eq!(queue.list_for_document(a).unwrap().len(), 2);
        assert_eq!(queue.clear_for_document(a).unwrap(), 2);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.list_all().unwrap()[0].update.document_id, b);
    }

    #[test]
    fn test_corrupt_record_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let torn_id = Uuid::new_v4();
        {
            let queue = open(&dir);
            queue.enqueue(update(doc, "console", json!("SD7"))).unwrap();
            let key = 99u64.to_be_bytes();
            queue
                .db
                .put_cf(queue.cf(CF_QUEUE).unwrap(), key, [3, 0, 0, 0, 0x30, b'x', b'y', b'z'])
                .unwrap();
            queue
                .db
                .put_cf(queue.cf(CF_INDEX).unwrap(), torn_id.as_bytes(), key)
                .unwrap();
        }

        let queue = open(&dir);
        let entries = queue.list_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].update.value, json!("SD7"));
        assert_eq!(queue.len().unwrap(), 1);
        assert!(!queue.contains(torn_id).unwrap());

        queue.enqueue(update(doc, "inputs", json!(48))).unwrap();
        assert_eq!(queue.list_for_document(doc).unwrap().len(), 2);
        assert_eq!(queue.clear_for_document(doc).unwrap(), 2);
    }

    #[test]
    fn test_sequence_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let queue = open(&dir);
            queue.enqueue(update(doc, "n", json!(1))).unwrap();
            queue.enqueue(update(doc, "n", json!(2))).unwrap();
        }
        let queue = open(&dir);
        queue.enqueue(update(doc, "n", json!(3))).unwrap();

        let values: Vec<_> = queue
            .list_all()
            .unwrap()
            .into_iter()
            .map(|e| e.update.value)
            .collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }
}
