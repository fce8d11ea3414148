//! Document identity and field storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a stored document row.
pub type DocumentId = Uuid;

/// Identifier of an authenticated (or anonymous share-link) collaborator.
pub type UserId = Uuid;

/// Field name → opaque value. Ordered so that iteration and serialization
/// are stable across processes.
pub type FieldMap = BTreeMap<String, Value>;

/// Name of the last-modified column every document table carries.
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Known document kinds. Each kind lives in its own store table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    PatchSheet,
    StagePlot,
    RunOfShow,
    ProductionSchedule,
    PixelMap,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::PatchSheet,
        DocumentType::StagePlot,
        DocumentType::RunOfShow,
        DocumentType::ProductionSchedule,
        DocumentType::PixelMap,
    ];

    /// Store table backing this document kind.
    pub fn table(&self) -> &'static str {
        match self {
            DocumentType::PatchSheet => "patch_sheets",
            DocumentType::StagePlot => "stage_plots",
            DocumentType::RunOfShow => "run_of_shows",
            DocumentType::ProductionSchedule => "production_schedules",
            DocumentType::PixelMap => "pixel_maps",
        }
    }

    /// Pub/sub channel name used for a document of this kind.
    pub fn channel_name(&self, doc_id: DocumentId) -> String {
        format!("{}:{doc_id}", self.table())
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Share-link token allowing anonymous edits without per-user row
/// ownership. The store validates it on the scoped write path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareScope {
    pub token: String,
}

impl ShareScope {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_includes_table_and_id() {
        let id = Uuid::nil();
        let name = DocumentType::StagePlot.channel_name(id);
        assert_eq!(name, format!("stage_plots:{id}"));
    }

    #[test]
    fn test_document_type_serde_snake_case() {
        let json = serde_json::to_string(&DocumentType::RunOfShow).unwrap();
        assert_eq!(json, "\"run_of_show\"");
        let back: DocumentType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DocumentType::RunOfShow);
    }

    #[test]
    fn test_tables_are_distinct() {
        let mut tables: Vec<&str> = DocumentType::ALL.iter().map(|t| t.table()).collect();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), DocumentType::ALL.len());
    }
}
