//! Field-level change detection.
//!
//! The detector keeps two snapshots: the *baseline* (what the store is
//! believed to hold) and the *current* state (what the editor shows). A
//! local transition yields the fields where current differs from baseline;
//! a remote transition moves both snapshots and never yields a save.
//!
//! Remote values for a field with an unsaved local edit only move the
//! baseline. The editor keeps the local value and the observation is
//! recorded so a later write can tell it overwrote someone.

use std::collections::{BTreeMap, BTreeSet};

use backline_core::{FieldDelta, FieldMap, UpdateOrigin};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A remote value seen for a field while a local edit to it was pending.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObservation {
    pub value: Value,
    /// Document version that carried the value, when known.
    pub version: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    baseline: FieldMap,
    current: FieldMap,
    version: u64,
    saved_at: Option<DateTime<Utc>>,
    editing_since: Option<u64>,
    remote_tag: bool,
    held: BTreeMap<String, RemoteObservation>,
}

impl ChangeDetector {
    pub fn new(initial: FieldMap, version: u64) -> Self {
        Self {
            baseline: initial.clone(),
            current: initial,
            version,
            saved_at: None,
            editing_since: None,
            remote_tag: false,
            held: BTreeMap::new(),
        }
    }

    /// Record a transition to `state` and return the unsaved field set.
    ///
    /// If [`mark_remote_update`](Self::mark_remote_update) was called since
    /// the last transition, the transition is treated as remote regardless
    /// of `origin`.
    pub fn observe(&mut self, state: FieldMap, origin: UpdateOrigin) -> Vec<FieldDelta> {
        let origin = if std::mem::take(&mut self.remote_tag) {
            UpdateOrigin::Remote
        } else {
            origin
        };

        match origin {
            UpdateOrigin::Local => {
                self.current = state;
                self.touch_burst();
                self.pending()
            }
            UpdateOrigin::Remote => {
                let changed: FieldMap = changed_fields(&self.current, &state)
                    .into_iter()
                    .map(|field| {
                        let value = state.get(&field).cloned().unwrap_or(Value::Null);
                        (field, value)
                    })
                    .collect();
                self.fold_remote(changed, None);
                Vec::new()
            }
        }
    }

    /// Set one field from the local editor.
    pub fn edit(&mut self, field: impl Into<String>, value: Value) -> Vec<FieldDelta> {
        let mut state = self.current.clone();
        state.insert(field.into(), value);
        self.observe(state, UpdateOrigin::Local)
    }

    /// Fold a partial remote update (broadcast or change stream) in.
    ///
    /// `version` is the document version that carried the values; the
    /// observed version only moves forward.
    pub fn apply_remote(&mut self, fields: FieldMap, version: Option<u64>) {
        self.remote_tag = false;
        let changed: FieldMap = fields
            .into_iter()
            .filter(|(field, value)| {
                self.current.get(field) != Some(value) || self.baseline.get(field) != Some(value)
            })
            .collect();
        self.fold_remote(changed, version);
        if let Some(version) = version {
            self.version = self.version.max(version);
        }
    }

    /// Tag the next observed transition as remote. Idempotent.
    pub fn mark_remote_update(&mut self) {
        self.remote_tag = true;
    }

    /// Whether the next observed transition will be folded in as remote.
    pub fn is_remote_tagged(&self) -> bool {
        self.remote_tag
    }

    /// Advance baseline and version after the store accepted `deltas`.
    pub fn commit(&mut self, deltas: &[FieldDelta], version: u64, saved_at: DateTime<Utc>) {
        for delta in deltas {
            self.baseline.insert(delta.field.clone(), delta.value.clone());
            self.held.remove(&delta.field);
        }
        if version < self.version {
            log::warn!(
                "store returned version {version} below observed {}, keeping observed",
                self.version
            );
        }
        self.version = self.version.max(version);
        self.saved_at = Some(saved_at);
        self.editing_since = if self.has_pending() {
            Some(self.version)
        } else {
            None
        };
    }

    /// Overwrite both snapshots with values the user chose to keep from
    /// the remote side.
    pub fn adopt(&mut self, fields: FieldMap) {
        for (field, value) in fields {
            self.held.remove(&field);
            self.baseline.insert(field.clone(), value.clone());
            self.current.insert(field, value);
        }
        if !self.has_pending() {
            self.editing_since = None;
        }
    }

    /// Move the baseline of `fields` to what the store holds, leaving the
    /// editor values alone. Fields whose editor value differs become
    /// pending again, expected against `version`.
    pub fn rebase(&mut self, fields: FieldMap, version: Option<u64>) {
        for (field, value) in fields {
            self.held.remove(&field);
            self.baseline.insert(field, value);
        }
        if let Some(version) = version {
            self.version = self.version.max(version);
        }
        self.editing_since = if self.has_pending() {
            Some(self.version)
        } else {
            None
        };
    }

    /// Whether `field` has an unsaved local edit.
    pub fn is_edited(&self, field: &str) -> bool {
        self.current.get(field) != self.baseline.get(field)
    }

    /// Fields where the current state differs from the baseline.
    pub fn pending(&self) -> Vec<FieldDelta> {
        changed_fields(&self.baseline, &self.current)
            .into_iter()
            .map(|field| {
                let value = self.current.get(&field).cloned().unwrap_or(Value::Null);
                let previous = self.baseline.get(&field).cloned();
                FieldDelta::new(field, value, previous)
            })
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !changed_fields(&self.baseline, &self.current).is_empty()
    }

    pub fn observed_version(&self) -> u64 {
        self.version
    }

    /// Version observed when the current unsaved burst started.
    pub fn editing_since_version(&self) -> Option<u64> {
        self.editing_since
    }

    /// Version to send as the write's expectation.
    pub fn expected_version(&self) -> u64 {
        self.editing_since.unwrap_or(self.version)
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    pub fn current(&self) -> &FieldMap {
        &self.current
    }

    pub fn baseline(&self) -> &FieldMap {
        &self.baseline
    }

    pub fn remote_observation(&self, field: &str) -> Option<&RemoteObservation> {
        self.held.get(field)
    }

    fn touch_burst(&mut self) {
        if self.has_pending() {
            self.editing_since.get_or_insert(self.version);
        } else {
            self.editing_since = None;
        }
    }

    fn fold_remote(&mut self, fields: FieldMap, version: Option<u64>) {
        let now = Utc::now();
        for (field, value) in fields {
            let locally_edited = self.current.get(&field) != self.baseline.get(&field);
            if locally_edited {
                if self.current.get(&field) != Some(&value) {
                    log::debug!("holding remote value for '{field}' behind local edit");
                    self.held.insert(
                        field.clone(),
                        RemoteObservation {
                            value: value.clone(),
                            version,
                            observed_at: now,
                        },
                    );
                }
                self.baseline.insert(field, value);
            } else {
                self.baseline.insert(field.clone(), value.clone());
                self.current.insert(field, value);
            }
        }
        self.touch_burst();
    }
}

fn changed_fields(from: &FieldMap, to: &FieldMap) -> Vec<String> {
    let keys: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
    keys.into_iter()
        .filter(|key| {
            let a = from.get(*key).unwrap_or(&Value::Null);
            let b = to.get(*key).unwrap_or(&Value::Null);
            a != b
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(
            state(&[
                ("title", json!("Main Stage")),
                ("inputs", json!([{"ch": 1, "name": "Kick"}])),
            ]),
            5,
        )
    }

    #[test]
    fn test_rebase_keeps_editor_value_pending() {
        let mut d = detector();
        d.edit("title", json!("Mine"));
        d.rebase(state(&[("title", json!("Theirs"))]), Some(7));

        assert!(d.is_edited("title"));
        assert_eq!(d.current()["title"], json!("Mine"));
        assert_eq!(d.pending()[0].previous, Some(json!("Theirs")));
        assert_eq!(d.expected_version(), 7);
    }

    #[test]
    fn test_identical_content_is_silent() {
        let mut d = detector();
        let same = state(&[
            ("inputs", json!([{"name": "Kick", "ch": 1}])),
            ("title", json!("Main Stage")),
        ]);
        assert!(d.observe(same, UpdateOrigin::Local).is_empty());
        assert_eq!(d.editing_since_version(), None);
    }

    #[test]
    fn test_local_edit_yields_delta() {
        let mut d = detector();
        let deltas = d.edit("title", json!("Side Stage"));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].field, "title");
        assert_eq!(deltas[0].previous, Some(json!("Main Stage")));
        assert_eq!(d.editing_since_version(), Some(5));
    }

    #[test]
    fn test_nested_array_change_detected() {
        let mut d = detector();
        let deltas = d.edit("inputs", json!([{"ch": 1, "name": "Kick In"}]));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].field, "inputs");
    }

    #[test]
    fn test_remote_transition_never_saves() {
        let mut d = detector();
        let mut next = d.current().clone();
        next.insert("title".into(), json!("Remote Title"));

        assert!(d.observe(next.clone(), UpdateOrigin::Remote).is_empty());
        assert!(!d.has_pending());
        // Applying the same transition again is a no-op.
        assert!(d.observe(next, UpdateOrigin::Remote).is_empty());
        assert!(!d.has_pending());
        assert_eq!(d.current()["title"], json!("Remote Title"));
    }

    #[test]
    fn test_mark_remote_is_a_flag() {
        let mut d = detector();
        d.mark_remote_update();
        d.mark_remote_update();

        let mut next = d.current().clone();
        next.insert("title".into(), json!("From peer"));
        assert!(d.observe(next, UpdateOrigin::Local).is_empty());

        // Only one transition was tagged.
        let deltas = d.edit("title", json!("Mine"));
        assert_eq!(deltas.len(), 1);
    }

    #[test]
    fn test_apply_remote_consumes_tag() {
        let mut d = detector();
        d.mark_remote_update();
        assert!(d.is_remote_tagged());

        let mut theirs = FieldMap::new();
        theirs.insert("title".into(), json!("From peer"));
        d.apply_remote(theirs, Some(2));
        assert!(!d.is_remote_tagged());

        assert_eq!(d.edit("title", json!("Mine")).len(), 1);
    }

    #[test]
    fn test_remote_held_behind_local_edit() {
        let mut d = detector();
        d.edit("title", json!("Local"));

        d.apply_remote(state(&[("title", json!("Remote"))]), Some(6));

        assert_eq!(d.current()["title"], json!("Local"));
        let seen = d.remote_observation("title").unwrap();
        assert_eq!(seen.value, json!("Remote"));
        assert_eq!(seen.version, Some(6));
        assert_eq!(d.observed_version(), 6);
        assert_eq!(d.expected_version(), 5);

        let pending = d.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].previous, Some(json!("Remote")));
    }

    #[test]
    fn test_apply_remote_twice_is_idempotent() {
        let mut d = detector();
        let fields = state(&[("title", json!("Remote"))]);
        d.apply_remote(fields.clone(), Some(6));
        d.apply_remote(fields, Some(6));
        assert!(d.pending().is_empty());
        assert_eq!(d.observed_version(), 6);
    }

    #[test]
    fn test_commit_advances_baseline() {
        let mut d = detector();
        let deltas = d.edit("title", json!("Saved"));
        d.commit(&deltas, 6, Utc::now());

        assert!(!d.has_pending());
        assert_eq!(d.observed_version(), 6);
        assert_eq!(d.editing_since_version(), None);
        assert!(d.last_saved_at().is_some());
    }

    #[test]
    fn test_commit_keeps_later_edits_pending() {
        let mut d = detector();
        let first = d.edit("title", json!("one"));
        d.edit("title", json!("two"));
        d.commit(&first, 6, Utc::now());

        let pending = d.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, json!("two"));
        assert_eq!(d.editing_since_version(), Some(6));
    }

    #[test]
    fn test_commit_never_lowers_version() {
        let mut d = detector();
        d.commit(&[], 3, Utc::now());
        assert_eq!(d.observed_version(), 5);
    }

    #[test]
    fn test_adopt_overrides_local() {
        let mut d = detector();
        d.edit("title", json!("Local"));
        d.apply_remote(state(&[("title", json!("Remote"))]), Some(6));
        d.adopt(state(&[("title", json!("Remote"))]));

        assert!(!d.has_pending());
        assert!(d.remote_observation("title").is_none());
        assert_eq!(d.current()["title"], json!("Remote"));
    }
}
