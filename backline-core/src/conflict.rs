//! Field-granularity conflicts between a local edit and the stored value.
//!
//! Conflicts are detected after the fact (optimistic concurrency) and are
//! never resolved by silently overwriting: the user picks a side per
//! field, or accepts the suggestion (newer timestamp wins).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{DocumentId, FieldMap};

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    /// Store version that carried this value, when known.
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionChoice {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentConflict {
    pub document_id: DocumentId,
    pub field: String,
    pub local: ConflictSide,
    pub remote: ConflictSide,
    pub suggested: ResolutionChoice,
}

impl DocumentConflict {
    /// Build a conflict, suggesting the side with the newer timestamp.
    /// Ties go to the remote side since the store already holds it.
    pub fn new(
        document_id: DocumentId,
        field: impl Into<String>,
        local: ConflictSide,
        remote: ConflictSide,
    ) -> Self {
        let suggested = if local.timestamp > remote.timestamp {
            ResolutionChoice::Local
        } else {
            ResolutionChoice::Remote
        };
        Self {
            document_id,
            field: field.into(),
            local,
            remote,
            suggested,
        }
    }
}

/// User decision for a set of conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Take the suggestion for every field.
    Suggested,
    KeepLocal,
    KeepRemote,
    /// Field-by-field choice. Fields missing from the map use the suggestion.
    Merge(BTreeMap<String, ResolutionChoice>),
}

impl ConflictResolution {
    pub fn choice_for(&self, conflict: &DocumentConflict) -> ResolutionChoice {
        match self {
            ConflictResolution::Suggested => conflict.suggested,
            ConflictResolution::KeepLocal => ResolutionChoice::Local,
            ConflictResolution::KeepRemote => ResolutionChoice::Remote,
            ConflictResolution::Merge(choices) => choices
                .get(&conflict.field)
                .copied()
                .unwrap_or(conflict.suggested),
        }
    }

    /// Split conflicts into values that must be written back to the store
    /// (local wins) and values that must be adopted locally (remote wins).
    pub fn apply(&self, conflicts: &[DocumentConflict]) -> ResolvedFields {
        let mut resolved = ResolvedFields::default();
        for conflict in conflicts {
            match self.choice_for(conflict) {
                ResolutionChoice::Local => {
                    resolved
                        .write_back
                        .insert(conflict.field.clone(), conflict.local.value.clone());
                }
                ResolutionChoice::Remote => {
                    resolved
                        .adopt
                        .insert(conflict.field.clone(), conflict.remote.value.clone());
                }
            }
        }
        resolved
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedFields {
    pub write_back: FieldMap,
    pub adopt: FieldMap,
}
