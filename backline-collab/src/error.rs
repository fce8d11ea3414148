//! Crate-level error types.
//!
//! Each subsystem owns its error enum next to its code
//! ([`StoreError`], [`QueueError`], [`ChannelError`], [`ProtocolError`],
//! [`ConfigError`]); [`CollabError`] wraps them for callers that do not
//! care which layer failed. [`SaveError`] is the classified failure carried
//! by a save result.

use backline_core::InvalidTransition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("document session has shut down")]
    SessionClosed,
}

/// How a failed write should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveErrorKind {
    /// No connectivity: the write belongs in the offline queue.
    NetworkUnavailable,
    /// Worth retrying with backoff.
    Transient,
    /// The store refused the write; retrying will not help.
    Rejected,
    /// Optimistic-concurrency check failed.
    VersionConflict,
}

impl SaveErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SaveErrorKind::Transient)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct SaveError {
    pub kind: SaveErrorKind,
    pub message: String,
}

impl SaveError {
    pub fn new(kind: SaveErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&StoreError> for SaveError {
    fn from(err: &StoreError) -> Self {
        let kind = match err {
            StoreError::Unavailable(_) => SaveErrorKind::NetworkUnavailable,
            StoreError::Backend(_) => SaveErrorKind::Transient,
            StoreError::VersionMismatch { .. } => SaveErrorKind::VersionConflict,
            StoreError::Rejected(_) | StoreError::NotFound(_) => SaveErrorKind::Rejected,
        };
        SaveError::new(kind, err.to_string())
    }
}
