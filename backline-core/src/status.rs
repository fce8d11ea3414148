//! Save-status state machine and channel connection status.
//!
//! ```text
//!            Edited                SaveStarted
//!   Idle ───────────► Typing ────────────────────► Saving
//!    ▲                  ▲  ▲                       │ │ │ │
//!    │ Disabled (any)   │  └─ SaveSucceeded{pending}┘ │ │ │
//!    │                  │                            │ │ │
//!   Saved ◄─────────────┼── SaveSucceeded ───────────┘ │ │
//!   Error ◄─────────────┼── SaveFailed / Conflict ─────┘ │
//!   Offline ◄───────────┴── Queued ──────────────────────┘
//! ```
//!
//! Saved, Error and Offline accept `Edited` (→ Typing) and `SaveStarted`
//! (→ Saving, used for retries and queue drains). `Settled` moves Typing or
//! Error to Saved when nothing is left to write.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    #[default]
    Idle,
    Typing,
    Saving,
    Saved,
    Error,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveEvent {
    /// A local edit changed at least one field.
    Edited,
    /// A write (or queue drain) was issued.
    SaveStarted,
    /// The store acknowledged the write. `pending` is true when further
    /// local edits arrived while it was in flight.
    SaveSucceeded { pending: bool },
    /// Terminal failure (retry budget exhausted or rejected).
    SaveFailed,
    /// A conflict was raised and awaits a user decision.
    ConflictDetected,
    /// Network unavailable, the write went to the offline queue.
    Queued,
    /// Nothing is left to save (edit reverted, or conflicts resolved
    /// without a write).
    Settled,
    /// Autosave was switched off.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid save status transition: {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: SaveStatus,
    pub event: SaveEvent,
}

impl SaveStatus {
    /// Next state for `event`, or `InvalidTransition` if the event is not
    /// allowed in the current state.
    pub fn apply(self, event: SaveEvent) -> Result<SaveStatus, InvalidTransition> {
        use SaveStatus::*;
        let next = match (self, event) {
            (_, SaveEvent::Disabled) => Idle,

            (Saving, SaveEvent::Edited) => Saving,
            (_, SaveEvent::Edited) => Typing,

            (Saving, SaveEvent::SaveStarted) => {
                return Err(InvalidTransition { from: self, event });
            }
            (_, SaveEvent::SaveStarted) => Saving,

            (Saving, SaveEvent::SaveSucceeded { pending: true }) => Typing,
            (Saving, SaveEvent::SaveSucceeded { pending: false }) => Saved,
            (Saving, SaveEvent::SaveFailed) => Error,
            (Saving, SaveEvent::ConflictDetected) => Error,
            (Saving, SaveEvent::Queued) => Offline,

            // A conflict found by a post-write check arrives after success.
            (Saved | Typing, SaveEvent::ConflictDetected) => Error,

            (Typing | Error, SaveEvent::Settled) => Saved,

            _ => return Err(InvalidTransition { from: self, event }),
        };
        Ok(next)
    }

    /// Whether leaving now could lose work (unload confirmation).
    pub fn has_unsaved_changes(&self) -> bool {
        matches!(self, SaveStatus::Typing | SaveStatus::Saving)
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Typing => "typing",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved => "saved",
            SaveStatus::Error => "error",
            SaveStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Status of one long-lived channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}
