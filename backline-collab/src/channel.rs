//! Pub/sub abstraction for document channels.
//!
//! A [`PubSub`] opens a named channel for one member and returns a
//! [`ChannelHandle`]: a shared [`ChannelLink`] for outgoing traffic and an
//! event receiver for incoming traffic. When the receiver closes, the
//! subscription is gone and must be reopened.
//!
//! Implementations never deliver a member's own broadcasts back to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backline_core::PresenceUser;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{BroadcastMessage, MemberInfo, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("subscription not confirmed within {0:?}")]
    Timeout(Duration),
    #[error("channel closed")]
    Closed,
    #[error("channel error: {0}")]
    Remote(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast {
        sender: MemberInfo,
        message: BroadcastMessage,
    },
    /// Full roster after any join, leave or state change.
    Presence(Vec<PresenceUser>),
    /// The subscription failed; no further events will arrive.
    Error(String),
}

/// Which incoming events a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    pub broadcast: bool,
    pub presence: bool,
}

impl EventFilter {
    pub const ALL: EventFilter = EventFilter {
        broadcast: true,
        presence: true,
    };
    pub const BROADCAST: EventFilter = EventFilter {
        broadcast: true,
        presence: false,
    };
    pub const PRESENCE: EventFilter = EventFilter {
        broadcast: false,
        presence: true,
    };

    pub fn accepts(&self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::Broadcast { .. } => self.broadcast,
            ChannelEvent::Presence(_) => self.presence,
            ChannelEvent::Error(_) => true,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::ALL
    }
}

#[async_trait]
pub trait ChannelLink: Send + Sync {
    /// Fan `message` out to every other member. Best effort.
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), ChannelError>;

    /// Set this member's presence entry.
    async fn track(&self, user: PresenceUser) -> Result<(), ChannelError>;

    /// Remove this member's presence entry.
    async fn untrack(&self) -> Result<(), ChannelError>;

    async fn presence_snapshot(&self) -> Result<Vec<PresenceUser>, ChannelError>;

    /// Leave the channel. The event receiver closes.
    async fn close(&self);

    fn member(&self) -> &MemberInfo;
}

pub struct ChannelHandle {
    pub link: Arc<dyn ChannelLink>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("member", self.link.member())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn open_channel(
        &self,
        name: &str,
        member: MemberInfo,
        filter: EventFilter,
    ) -> Result<ChannelHandle, ChannelError>;
}
