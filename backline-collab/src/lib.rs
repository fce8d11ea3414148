//! # backline-collab: Collaborative persistence engine for Backline
//!
//! Turns a stream of local field edits into durable, ordered, conflict-aware
//! writes to a shared store, fans them out to everyone else editing the same
//! document, tracks who is present, and recovers from disconnects.
//!
//! ## Architecture
//!
//! ```text
//!   edit ──► ChangeDetector ──► Debouncer ──► SaveExecutor ──► DocumentStore
//!               ▲                                  │   │
//!               │ remote                  offline  │   │ transient
//!               │                                  ▼   ▼
//!   ┌───────────┴──────────┐              OfflineQueue  RetryController
//!   │    DocumentSession   │                  (RocksDB)
//!   │  (one task per doc)  │
//!   └───┬──────────────┬───┘
//!       │              │
//!       ▼              ▼
//!  Supervisor<Pub/Sub> Supervisor<ChangeStream>
//!       │
//!  ┌────┴─────┐   WebSocket   ┌─────────────┐
//!  │ LocalHub │ ◄───────────► │ RelayServer │
//!  └──────────┘   (WsPubSub)  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`detector`]: Field-level change detection with origin tagging
//! - [`scheduler`]: Debounce and throttle tasks on the monotonic clock
//! - [`executor`]: One persistence attempt, routed by scope and connectivity
//! - [`queue`]: Durable offline queue (RocksDB + LZ4)
//! - [`retry`]: Exponential backoff and conflict checks
//! - [`channel`] / [`broadcast`]: Pub/sub abstraction and in-process hub
//! - [`presence`]: Throttled presence tracking with heartbeats
//! - [`reconnect`]: Supervised subscriptions with backoff
//! - [`session`]: Per-document worker wiring all of the above
//! - [`server`] / [`client`]: WebSocket relay and its transport

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod detector;
pub mod error;
pub mod executor;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use broadcast::{HubStats, LocalHub};
pub use channel::{ChannelError, ChannelEvent, ChannelHandle, ChannelLink, EventFilter, PubSub};
pub use client::WsPubSub;
pub use config::{
    ChannelConfig, CollabConfig, ConcurrencyMode, ConfigError, PresenceConfig, QueueConfig,
    ReconnectConfig, RetryConfig, SaveConfig,
};
pub use connectivity::Connectivity;
pub use detector::{ChangeDetector, RemoteObservation};
pub use error::{CollabError, SaveError, SaveErrorKind};
pub use executor::{SaveExecutor, SaveRequest, SaveResult};
pub use presence::PresenceTracker;
pub use protocol::{BroadcastMessage, Frame, MemberInfo, ProtocolError};
pub use queue::{OfflineQueue, QueueError, QueuedSave};
pub use reconnect::{
    ChannelConnector, Connect, LinkEvent, ReconnectPolicy, StreamConnector, Supervisor,
};
pub use retry::{detect_lost_updates, precheck, PreCheck, RetryController, RetryPolicy};
pub use scheduler::{Debouncer, Throttle, TrailingGate};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    DocumentSession, SessionEvent, SessionHandle, SessionOptions, SessionServices, SessionSnapshot,
};
pub use store::{
    ChangeStream, DocumentStore, MemoryStore, RowChange, RowEvent, RowFilter, StoreError,
    StoreWrite, StoredDocument,
};
