//! Field-level write intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::{DocumentId, DocumentType, FieldMap, ShareScope, UserId};

/// Where a state transition came from.
///
/// Remote transitions (broadcasts, change-stream pushes, conflict
/// resolutions that adopt the server value) must never produce a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// One changed attribute: (field, new value, previous value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field: String,
    pub value: Value,
    /// Last saved value, `None` when the field did not exist.
    pub previous: Option<Value>,
}

impl FieldDelta {
    pub fn new(field: impl Into<String>, value: Value, previous: Option<Value>) -> Self {
        Self {
            field: field.into(),
            value,
            previous,
        }
    }
}

/// Collect deltas into the field map a store write expects.
pub fn deltas_to_fields(deltas: &[FieldDelta]) -> FieldMap {
    deltas
        .iter()
        .map(|d| (d.field.clone(), d.value.clone()))
        .collect()
}

/// A single field write intent, as persisted by the offline queue and
/// tracked by the retry controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub document_type: DocumentType,
    pub field: String,
    pub value: Value,
    pub previous: Option<Value>,
    pub author: UserId,
    pub timestamp: DateTime<Utc>,
    /// Version the author observed when the edit burst began.
    pub expected_version: u64,
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ShareScope>,
}

impl DocumentUpdate {
    pub fn from_delta(
        document_id: DocumentId,
        document_type: DocumentType,
        author: UserId,
        delta: &FieldDelta,
        expected_version: u64,
        scope: Option<ShareScope>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            document_type,
            field: delta.field.clone(),
            value: delta.value.clone(),
            previous: delta.previous.clone(),
            author,
            timestamp: Utc::now(),
            expected_version,
            persisted: false,
            retry_count: None,
            last_error: None,
            scope,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count = Some(self.retry_count.unwrap_or(0) + 1);
        self.last_error = Some(error.into());
    }

    pub fn to_delta(&self) -> FieldDelta {
        FieldDelta::new(self.field.clone(), self.value.clone(), self.previous.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_failure_increments() {
        let delta = FieldDelta::new("title", json!("Main Stage"), None);
        let mut update = DocumentUpdate::from_delta(
            Uuid::new_v4(),
            DocumentType::StagePlot,
            Uuid::new_v4(),
            &delta,
            3,
            None,
        );
        assert_eq!(update.retry_count, None);

        update.record_failure("timeout");
        update.record_failure("503");
        assert_eq!(update.retry_count, Some(2));
        assert_eq!(update.last_error.as_deref(), Some("503"));
        assert!(!update.persisted);
    }

    #[test]
    fn test_deltas_to_fields_keeps_last_value() {
        let deltas = vec![
            FieldDelta::new("a", json!(1), None),
            FieldDelta::new("b", json!([1, 2]), Some(json!([1]))),
        ];
        let fields = deltas_to_fields(&deltas);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["b"], json!([1, 2]));
    }

    #[test]
    fn test_update_json_omits_empty_optionals() {
        let delta = FieldDelta::new("notes", json!("hi"), None);
        let update = DocumentUpdate::from_delta(
            Uuid::new_v4(),
            DocumentType::PatchSheet,
            Uuid::new_v4(),
            &delta,
            0,
            None,
        );
        let text = serde_json::to_string(&update).unwrap();
        assert!(!text.contains("retry_count"));
        let back: DocumentUpdate = serde_json::from_str(&text).unwrap();
        assert_eq!(back, update);
    }
}
