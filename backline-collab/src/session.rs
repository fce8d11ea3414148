//! One collaborative editing session per open document.
//!
//! ```text
//!  SessionHandle ──commands──►┐
//!  Debouncer ──quiet period──►│
//!  in-flight save ──result───►│   worker (one task, select loop)
//!  channel supervisor ───────►│     ├─ ChangeDetector
//!  change-stream supervisor ─►│     ├─ SaveExecutor / RetryController
//!  connectivity watch ───────►│     └─ PresenceTracker
//!  presence timers ──────────►┘
//!                                  │
//!                                  ├─► watch: snapshot / connection / roster
//!                                  └─► mpsc: SessionEvent
//! ```
//!
//! At most one save is in flight. Anything that changes while it runs is
//! re-derived from the detector once it completes; queued offline saves
//! for the document are always replayed before a fresh save.

use std::sync::Arc;

use backline_core::{
    deltas_to_fields, ConflictResolution, ConnectionStatus, DocumentConflict, DocumentId,
    DocumentType, FieldMap, PresenceState, PresenceUser, SaveEvent, SaveStatus, ShareScope,
    UpdateOrigin, UserId, UPDATED_AT_FIELD,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{ChannelEvent, ChannelLink, EventFilter, PubSub};
use crate::config::{CollabConfig, ConcurrencyMode};
use crate::connectivity::Connectivity;
use crate::detector::ChangeDetector;
use crate::error::{CollabError, SaveError, SaveErrorKind};
use crate::executor::{SaveExecutor, SaveRequest, SaveResult};
use crate::presence::PresenceTracker;
use crate::protocol::{BroadcastMessage, MemberInfo};
use crate::queue::{OfflineQueue, QueuedSave};
use crate::reconnect::{ChannelConnector, LinkEvent, ReconnectPolicy, StreamConnector, Supervisor};
use crate::retry::{detect_lost_updates, RetryController};
use crate::scheduler::Debouncer;
use crate::store::{ChangeStream, DocumentStore, RowChange, RowEvent, RowFilter};

/// What to open.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub document_id: DocumentId,
    pub document_type: DocumentType,
    pub user: PresenceUser,
    /// Field values as loaded, at `version`.
    pub initial: FieldMap,
    pub version: u64,
    pub scope: Option<ShareScope>,
    pub config: CollabConfig,
}

impl SessionOptions {
    pub fn new(
        document_id: DocumentId,
        document_type: DocumentType,
        user: PresenceUser,
        initial: FieldMap,
        version: u64,
    ) -> Self {
        Self {
            document_id,
            document_type,
            user,
            initial,
            version,
            scope: None,
            config: CollabConfig::default(),
        }
    }

    pub fn with_scope(mut self, scope: ShareScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }
}

/// Backends a session talks to. Only the store is mandatory.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn DocumentStore>,
    pub changes: Option<Arc<dyn ChangeStream>>,
    pub pubsub: Option<Arc<dyn PubSub>>,
    pub queue: Option<Arc<OfflineQueue>>,
    pub connectivity: Connectivity,
}

impl SessionServices {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            changes: None,
            pubsub: None,
            queue: None,
            connectivity: Connectivity::online(),
        }
    }

    pub fn with_changes(mut self, changes: Arc<dyn ChangeStream>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(SaveStatus),
    Saved {
        version: u64,
        saved_at: DateTime<Utc>,
    },
    /// Values from another author the editor should now display.
    RemoteUpdate {
        fields: FieldMap,
        version: Option<u64>,
    },
    /// Awaiting [`SessionHandle::resolve_conflicts`].
    Conflict(Vec<DocumentConflict>),
    Error(SaveError),
    /// Cursor or selection traffic from a peer.
    Peer {
        sender: MemberInfo,
        message: BroadcastMessage,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SaveStatus,
    pub version: u64,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<SaveError>,
    pub conflicts: Vec<DocumentConflict>,
}

enum Command {
    Edit(FieldMap),
    Replace {
        state: FieldMap,
        origin: UpdateOrigin,
    },
    ApplyRemote {
        fields: FieldMap,
        version: Option<u64>,
    },
    MarkRemote,
    ForceSave(oneshot::Sender<Option<SaveResult>>),
    SetEnabled(bool),
    Focus {
        field: String,
        cursor: Option<u32>,
    },
    Blur,
    Broadcast(BroadcastMessage),
    Resolve(ConflictResolution),
    Reconnect,
    Shutdown(oneshot::Sender<()>),
}

pub struct DocumentSession;

impl DocumentSession {
    /// Start the session worker. Must be called inside a tokio runtime.
    pub fn spawn(options: SessionOptions, services: SessionServices) -> SessionHandle {
        let SessionOptions {
            document_id,
            document_type,
            user,
            initial,
            version,
            scope,
            config,
        } = options;

        let executor = Arc::new(SaveExecutor::new(
            services.store.clone(),
            services.queue.clone(),
            services.connectivity.clone(),
            config.save.concurrency,
        ));
        let retry = Arc::new(RetryController::new(executor.clone(), &config.retry));
        let (debouncer, debounced) = Debouncer::spawn(config.save.quiet_period());

        let me = MemberInfo::new(user.user_id, user.display_name.clone());
        let presence = PresenceTracker::new(user.clone(), config.presence.clone());
        let roster = presence.subscribe();
        let policy = ReconnectPolicy::from(&config.reconnect);

        let (channel_sup, channel_rx) = match &services.pubsub {
            Some(pubsub) => {
                let connector = ChannelConnector::new(
                    pubsub.clone(),
                    document_type.channel_name(document_id),
                    me.clone(),
                    EventFilter::ALL,
                );
                let (sup, rx) = Supervisor::spawn(connector, policy, config.channel.event_buffer);
                (Some(sup), Some(rx))
            }
            None => (None, None),
        };
        let (stream_sup, stream_rx) = match &services.changes {
            Some(changes) => {
                let connector = StreamConnector::new(
                    changes.clone(),
                    document_type.table(),
                    RowEvent::Update,
                    RowFilter::Id(document_id),
                );
                let (sup, rx) = Supervisor::spawn(connector, policy, config.channel.event_buffer);
                (Some(sup), Some(rx))
            }
            None => (None, None),
        };

        let (fixed_connection, connection) = match &channel_sup {
            Some(sup) => (None, sup.subscribe()),
            None => {
                let (tx, rx) = watch::channel(ConnectionStatus::Disconnected);
                (Some(tx), rx)
            }
        };

        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot {
            version,
            ..SessionSnapshot::default()
        });
        let (events_tx, events_rx) = mpsc::channel(config.channel.event_buffer.max(1));
        let (tx, commands) = mpsc::channel(config.channel.capacity.max(1));
        let online = services.connectivity.subscribe();

        log::info!("opening session for {document_type} {document_id} as {}", me.display_name);

        let worker = Worker {
            doc_id: document_id,
            doc_type: document_type,
            author: user.user_id,
            scope,
            mode: config.save.concurrency,
            enabled: config.save.enabled,
            detector: ChangeDetector::new(initial, version),
            executor,
            retry,
            debouncer,
            presence,
            link: None,
            channel_sup,
            stream_sup,
            in_flight: None,
            resave: false,
            drain_pending: false,
            waiters: Vec::new(),
            next_waiters: Vec::new(),
            conflicts: Vec::new(),
            conflicts_written: false,
            snapshot: snapshot_tx,
            events: events_tx,
            _fixed_connection: fixed_connection,
        };
        let inputs = Inputs {
            commands,
            debounced,
            channel: channel_rx,
            stream: stream_rx,
            online,
        };
        let task = tokio::spawn(worker.run(inputs));

        SessionHandle {
            document_id,
            tx,
            snapshot,
            connection,
            roster,
            event_rx: Some(events_rx),
            task,
        }
    }
}

/// Caller side of a running session.
pub struct SessionHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    connection: watch::Receiver<ConnectionStatus>,
    roster: watch::Receiver<Vec<PresenceUser>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), CollabError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CollabError::SessionClosed)
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Local edit of one field.
    pub async fn edit(&self, field: impl Into<String>, value: Value) -> Result<(), CollabError> {
        let mut fields = FieldMap::new();
        fields.insert(field.into(), value);
        self.send(Command::Edit(fields)).await
    }

    pub async fn edit_fields(&self, fields: FieldMap) -> Result<(), CollabError> {
        self.send(Command::Edit(fields)).await
    }

    /// Report the editor's full state after a transition.
    pub async fn replace_state(
        &self,
        state: FieldMap,
        origin: UpdateOrigin,
    ) -> Result<(), CollabError> {
        self.send(Command::Replace { state, origin }).await
    }

    /// Fold values the editor received out of band.
    pub async fn apply_remote(
        &self,
        fields: FieldMap,
        version: Option<u64>,
    ) -> Result<(), CollabError> {
        self.send(Command::ApplyRemote { fields, version }).await
    }

    /// The next state transition is remote, whatever origin it reports.
    pub async fn mark_remote_update(&self) -> Result<(), CollabError> {
        self.send(Command::MarkRemote).await
    }

    /// Save now, skipping the quiet period. Resolves when the save that
    /// carries the current edits completes; `None` if nothing was pending.
    pub async fn force_save(&self) -> Result<Option<SaveResult>, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceSave(reply)).await?;
        rx.await.map_err(|_| CollabError::SessionClosed)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), CollabError> {
        self.send(Command::SetEnabled(enabled)).await
    }

    pub async fn focus(
        &self,
        field: impl Into<String>,
        cursor: Option<u32>,
    ) -> Result<(), CollabError> {
        self.send(Command::Focus {
            field: field.into(),
            cursor,
        })
        .await
    }

    pub async fn blur(&self) -> Result<(), CollabError> {
        self.send(Command::Blur).await
    }

    /// Send cursor or selection traffic to peers.
    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<(), CollabError> {
        self.send(Command::Broadcast(message)).await
    }

    pub async fn resolve_conflicts(&self, resolution: ConflictResolution) -> Result<(), CollabError> {
        self.send(Command::Resolve(resolution)).await
    }

    pub async fn reconnect(&self) -> Result<(), CollabError> {
        self.send(Command::Reconnect).await
    }

    pub fn status(&self) -> SaveStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn connection(&self) -> ConnectionStatus {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.clone()
    }

    pub fn roster(&self) -> Vec<PresenceUser> {
        self.roster.borrow().clone()
    }

    pub fn watch_roster(&self) -> watch::Receiver<Vec<PresenceUser>> {
        self.roster.clone()
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.borrow().last_saved_at
    }

    pub fn last_error(&self) -> Option<SaveError> {
        self.snapshot.borrow().last_error.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.snapshot.borrow().status.has_unsaved_changes()
    }

    /// Take the event receiver. Only the first call returns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Save what is pending, leave presence and close every subscription.
    pub async fn shutdown(self) -> Result<(), CollabError> {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(Command::Shutdown(reply)).await.is_ok();
        if sent {
            let _ = rx.await;
        }
        let _ = self.task.await;
        Ok(())
    }
}

type ChannelLinkEvent = LinkEvent<Arc<dyn ChannelLink>, ChannelEvent>;
type StreamLinkEvent = LinkEvent<(), RowChange>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveKind {
    Fresh,
    Replay,
}

struct Completion {
    request: SaveRequest,
    result: SaveResult,
    kind: SaveKind,
}

struct Inputs {
    commands: mpsc::Receiver<Command>,
    debounced: mpsc::UnboundedReceiver<()>,
    channel: Option<mpsc::Receiver<ChannelLinkEvent>>,
    stream: Option<mpsc::Receiver<StreamLinkEvent>>,
    online: watch::Receiver<bool>,
}

struct Worker {
    doc_id: DocumentId,
    doc_type: DocumentType,
    author: UserId,
    scope: Option<ShareScope>,
    mode: ConcurrencyMode,
    enabled: bool,
    detector: ChangeDetector,
    executor: Arc<SaveExecutor>,
    retry: Arc<RetryController>,
    debouncer: Debouncer<()>,
    presence: PresenceTracker,
    link: Option<Arc<dyn ChannelLink>>,
    channel_sup: Option<Supervisor>,
    stream_sup: Option<Supervisor>,
    in_flight: Option<JoinHandle<Option<Completion>>>,
    /// A save was requested while another was in flight.
    resave: bool,
    drain_pending: bool,
    /// Answered when the in-flight save completes.
    waiters: Vec<oneshot::Sender<Option<SaveResult>>>,
    /// Answered by the save after that.
    next_waiters: Vec<oneshot::Sender<Option<SaveResult>>>,
    conflicts: Vec<DocumentConflict>,
    /// The conflicting local values already reached the store.
    conflicts_written: bool,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::Sender<SessionEvent>,
    _fixed_connection: Option<watch::Sender<ConnectionStatus>>,
}

impl Worker {
    async fn run(mut self, mut inputs: Inputs) {
        if self.executor.connectivity().is_online() && self.has_queued() {
            self.start_drain();
        }

        loop {
            let presence_due = self.presence.deadline();
            let heartbeat_at = self.presence.next_heartbeat();

            tokio::select! {
                cmd = inputs.commands.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        self.finish().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.finish().await;
                        return;
                    }
                },
                Some(()) = inputs.debounced.recv() => {
                    if self.enabled {
                        self.start_save();
                    }
                }
                done = join_in_flight(&mut self.in_flight) => match done {
                    Some(done) => self.on_complete(done).await,
                    None => self.on_lost_save(),
                },
                event = recv_opt(&mut inputs.channel) => match event {
                    Some(event) => self.on_channel(event).await,
                    None => inputs.channel = None,
                },
                change = recv_opt(&mut inputs.stream) => match change {
                    Some(LinkEvent::Event(row)) => self.on_row(row),
                    Some(_) => {}
                    None => inputs.stream = None,
                },
                Ok(()) = inputs.online.changed() => {
                    let online = *inputs.online.borrow_and_update();
                    self.on_connectivity(online);
                }
                _ = sleep_opt(presence_due) => self.presence.flush_due().await,
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    self.presence.heartbeat().await;
                    let gone = self.presence.sweep_idle();
                    if !gone.is_empty() {
                        log::debug!("dropped {} idle collaborator(s) from {}", gone.len(), self.doc_id);
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Edit(fields) => {
                // One transition per command, so a remote tag covers every field.
                let tagged = self.detector.is_remote_tagged();
                let mut state = self.detector.current().clone();
                state.extend(fields);
                self.detector.observe(state, UpdateOrigin::Local);
                if !tagged {
                    self.after_local_change();
                }
            }
            Command::Replace { state, origin } => {
                let tagged = self.detector.is_remote_tagged();
                self.detector.observe(state, origin);
                if origin == UpdateOrigin::Local && !tagged {
                    self.after_local_change();
                }
            }
            Command::ApplyRemote { fields, version } => {
                self.apply_remote_fields(fields, version, false);
            }
            Command::MarkRemote => self.detector.mark_remote_update(),
            Command::ForceSave(reply) => {
                self.debouncer.cancel();
                self.next_waiters.push(reply);
                if self.in_flight.is_some() {
                    self.resave = true;
                } else {
                    self.start_save();
                }
            }
            Command::SetEnabled(enabled) => {
                self.enabled = enabled;
                if !enabled {
                    self.debouncer.cancel();
                    self.transition(SaveEvent::Disabled);
                } else if self.detector.has_pending() {
                    self.transition(SaveEvent::Edited);
                    self.debouncer.schedule(());
                }
            }
            Command::Focus { field, cursor } => {
                self.presence
                    .track(PresenceState::editing(field, cursor))
                    .await;
            }
            Command::Blur => self.presence.clear().await,
            Command::Broadcast(message) => self.publish(&message).await,
            Command::Resolve(resolution) => self.resolve(resolution),
            Command::Reconnect => {
                for sup in [&self.channel_sup, &self.stream_sup].into_iter().flatten() {
                    sup.reconnect();
                }
            }
            Command::Shutdown(_) => {}
        }
    }

    fn after_local_change(&mut self) {
        if self.detector.has_pending() {
            self.transition(SaveEvent::Edited);
            if self.enabled {
                self.debouncer.schedule(());
            }
        } else if self.status() == SaveStatus::Typing {
            self.debouncer.cancel();
            self.transition(SaveEvent::Settled);
        }
    }

    fn start_save(&mut self) {
        if self.in_flight.is_some() {
            self.resave = true;
            return;
        }
        if self.executor.connectivity().is_online() && self.has_queued() {
            self.resave = true;
            self.start_drain();
            return;
        }

        self.waiters.append(&mut self.next_waiters);
        if !self.conflicts.is_empty() {
            let held = SaveResult::Conflict(self.conflicts.clone());
            self.reply_waiters(Some(held));
            return;
        }

        let deltas = self.detector.pending();
        if deltas.is_empty() {
            self.reply_waiters(None);
            if self.status() == SaveStatus::Typing {
                self.transition(SaveEvent::Settled);
            }
            return;
        }

        let request = SaveRequest::new(
            self.doc_id,
            self.doc_type,
            self.author,
            deltas,
            self.detector.expected_version(),
        )
        .with_scope(self.scope.clone());
        log::debug!(
            "saving {} field(s) of {} (expected v{})",
            request.deltas.len(),
            self.doc_id,
            request.expected_version
        );
        self.transition(SaveEvent::SaveStarted);

        let executor = self.executor.clone();
        let retry = self.retry.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let mut result = executor.save(&request).await;
            if let SaveResult::Failed { error } = &result {
                if error.kind.is_retryable() {
                    result = retry.run(&request, &[]).await;
                }
            }
            Some(Completion {
                request,
                result,
                kind: SaveKind::Fresh,
            })
        }));
    }

    fn start_drain(&mut self) {
        if self.in_flight.is_some() {
            self.drain_pending = true;
            return;
        }
        let entries = self.queued_entries();
        if entries.is_empty() {
            return;
        }
        self.transition(SaveEvent::SaveStarted);

        let retry = self.retry.clone();
        self.in_flight = Some(tokio::spawn(async move {
            retry
                .replay(entries)
                .await
                .map(|(request, result)| Completion {
                    request,
                    result,
                    kind: SaveKind::Replay,
                })
        }));
    }

    async fn on_complete(&mut self, done: Completion) {
        let Completion {
            request,
            result,
            kind,
        } = done;

        match &result {
            SaveResult::Saved { version, saved_at } => {
                let lost = if kind == SaveKind::Fresh && self.mode == ConcurrencyMode::LastWriteWins {
                    detect_lost_updates(&self.detector, &request, *version)
                } else {
                    Vec::new()
                };

                let untouched: FieldMap = if kind == SaveKind::Replay {
                    request
                        .deltas
                        .iter()
                        .filter(|d| !self.detector.is_edited(&d.field))
                        .filter(|d| self.detector.current().get(&d.field) != Some(&d.value))
                        .map(|d| (d.field.clone(), d.value.clone()))
                        .collect()
                } else {
                    FieldMap::new()
                };

                self.executor.commit(&mut self.detector, &request, &result);
                if !untouched.is_empty() {
                    self.detector.adopt(untouched.clone());
                    self.emit(SessionEvent::RemoteUpdate {
                        fields: untouched,
                        version: Some(*version),
                    });
                }

                log::debug!("saved {} at v{version}", self.doc_id);
                let observed = self.detector.observed_version();
                self.snapshot.send_modify(|s| {
                    s.version = observed;
                    s.last_saved_at = Some(*saved_at);
                    s.last_error = None;
                });
                self.transition(SaveEvent::SaveSucceeded {
                    pending: self.detector.has_pending(),
                });
                self.publish(&BroadcastMessage::FieldUpdate {
                    fields: deltas_to_fields(&request.deltas),
                    version: *version,
                    saved_at: *saved_at,
                    author: self.author,
                })
                .await;
                self.emit(SessionEvent::Saved {
                    version: *version,
                    saved_at: *saved_at,
                });

                if !lost.is_empty() {
                    self.raise_conflicts(lost, true);
                }
            }
            SaveResult::Offline { queued } => {
                log::info!("{} offline, {queued} change(s) queued", self.doc_id);
                self.transition(SaveEvent::Queued);
            }
            SaveResult::Failed { error } => {
                log::warn!("save of {} failed: {}", self.doc_id, error.message);
                self.snapshot
                    .send_modify(|s| s.last_error = Some(error.clone()));
                self.transition(SaveEvent::SaveFailed);
                self.emit(SessionEvent::Error(error.clone()));
            }
            SaveResult::Conflict(conflicts) => {
                self.raise_conflicts(conflicts.clone(), false);
            }
        }

        self.reply_waiters(Some(result));

        if std::mem::take(&mut self.drain_pending) && self.executor.connectivity().is_online() {
            self.start_drain();
            if self.in_flight.is_some() {
                return;
            }
        }
        if std::mem::take(&mut self.resave)
            && (self.detector.has_pending() || !self.next_waiters.is_empty())
        {
            self.start_save();
        }
    }

    fn on_lost_save(&mut self) {
        let error = SaveError::new(SaveErrorKind::Transient, "save task ended without a result");
        self.snapshot
            .send_modify(|s| s.last_error = Some(error.clone()));
        self.transition(SaveEvent::SaveFailed);
        self.reply_waiters(Some(SaveResult::Failed { error }));
    }

    fn raise_conflicts(&mut self, conflicts: Vec<DocumentConflict>, written: bool) {
        log::warn!(
            "{} conflicting field(s) on {}",
            conflicts.len(),
            self.doc_id
        );
        self.conflicts = conflicts.clone();
        self.conflicts_written = written;
        self.snapshot
            .send_modify(|s| s.conflicts = conflicts.clone());
        self.transition(SaveEvent::ConflictDetected);
        self.emit(SessionEvent::Conflict(conflicts));
    }

    fn resolve(&mut self, resolution: ConflictResolution) {
        if self.conflicts.is_empty() {
            return;
        }
        let conflicts = std::mem::take(&mut self.conflicts);
        let resolved = resolution.apply(&conflicts);

        if self.conflicts_written {
            // The store holds the local values; remote picks must be written.
            for (field, value) in &resolved.adopt {
                self.detector.edit(field.clone(), value.clone());
            }
        } else {
            let stored: FieldMap = conflicts
                .iter()
                .filter(|c| resolved.write_back.contains_key(&c.field))
                .map(|c| (c.field.clone(), c.remote.value.clone()))
                .collect();
            let version = conflicts.iter().filter_map(|c| c.remote.version).max();
            self.detector.adopt(resolved.adopt.clone());
            self.detector.rebase(stored, version);
        }

        log::info!(
            "resolved {} conflict(s) on {} ({} kept local, {} took remote)",
            conflicts.len(),
            self.doc_id,
            resolved.write_back.len(),
            resolved.adopt.len()
        );
        self.snapshot.send_modify(|s| s.conflicts.clear());
        if !resolved.adopt.is_empty() {
            self.emit(SessionEvent::RemoteUpdate {
                fields: resolved.adopt,
                version: None,
            });
        }

        if self.detector.has_pending() {
            self.transition(SaveEvent::Edited);
            self.start_save();
        } else {
            self.transition(SaveEvent::Settled);
        }
    }

    async fn on_channel(&mut self, event: ChannelLinkEvent) {
        match event {
            LinkEvent::Up { link, resumed } => {
                self.link = Some(link.clone());
                self.presence.attach(link).await;
                if !self.presence.is_tracked() {
                    self.presence.track(PresenceState::default()).await;
                }
                if resumed {
                    log::info!("resubscribed to {}, requesting sync", self.doc_id);
                    self.publish(&BroadcastMessage::SyncRequest {
                        user_id: self.author,
                    })
                    .await;
                    if self.executor.connectivity().is_online() && self.has_queued() {
                        self.start_drain();
                    }
                }
            }
            LinkEvent::Down => {
                self.link = None;
                self.presence.detach();
            }
            LinkEvent::Event(ChannelEvent::Broadcast { sender, message }) => {
                self.on_broadcast(sender, message).await;
            }
            LinkEvent::Event(ChannelEvent::Presence(roster)) => {
                self.presence.apply_roster(roster);
            }
            LinkEvent::Event(ChannelEvent::Error(reason)) => {
                log::warn!("channel for {} failed: {reason}", self.doc_id);
            }
        }
    }

    async fn on_broadcast(&mut self, sender: MemberInfo, message: BroadcastMessage) {
        match message {
            BroadcastMessage::FieldUpdate {
                fields, version, ..
            } => {
                self.apply_remote_fields(fields, Some(version), true);
            }
            BroadcastMessage::SyncRequest { user_id } => {
                let reply = BroadcastMessage::SyncResponse {
                    requester: user_id,
                    fields: self.detector.baseline().clone(),
                    version: self.detector.observed_version(),
                };
                self.publish(&reply).await;
            }
            BroadcastMessage::SyncResponse {
                requester,
                fields,
                version,
            } => {
                if requester == self.author && version > self.detector.observed_version() {
                    log::debug!("sync from {} brought {} to v{version}", sender.display_name, self.doc_id);
                    self.apply_remote_fields(fields, Some(version), true);
                }
            }
            message @ (BroadcastMessage::CursorMove { .. }
            | BroadcastMessage::SelectionChange { .. }) => {
                self.emit(SessionEvent::Peer { sender, message });
            }
        }
    }

    fn on_row(&mut self, row: RowChange) {
        let Some(new) = row.new else {
            return;
        };
        if new.id != self.doc_id || new.version <= self.detector.observed_version() {
            return;
        }
        self.apply_remote_fields(new.fields, Some(new.version), true);
    }

    fn on_connectivity(&mut self, online: bool) {
        if !online {
            log::info!("{} lost connectivity", self.doc_id);
            return;
        }
        if self.has_queued() {
            self.start_drain();
        } else if self.enabled
            && self.detector.has_pending()
            && self.status() == SaveStatus::Offline
        {
            self.start_save();
        }
    }

    fn apply_remote_fields(&mut self, mut fields: FieldMap, version: Option<u64>, notify: bool) {
        fields.remove(UPDATED_AT_FIELD);
        let before = self.detector.current().clone();
        self.detector.apply_remote(fields, version);

        let shown: FieldMap = self
            .detector
            .current()
            .iter()
            .filter(|(field, value)| before.get(*field) != Some(*value))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        let observed = self.detector.observed_version();
        self.snapshot.send_if_modified(|s| {
            let changed = s.version != observed;
            s.version = observed;
            changed
        });
        if notify && !shown.is_empty() {
            self.emit(SessionEvent::RemoteUpdate { fields: shown, version });
        }
    }

    async fn publish(&self, message: &BroadcastMessage) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(e) = link.publish(message).await {
            log::debug!("broadcast of {} failed: {e}", message.kind());
        }
    }

    async fn finish(mut self) {
        self.debouncer.cancel();
        let mut final_save = false;
        loop {
            if let Some(handle) = self.in_flight.take() {
                match handle.await {
                    Ok(Some(done)) => self.on_complete(done).await,
                    _ => self.on_lost_save(),
                }
                continue;
            }
            if !final_save && self.enabled && self.detector.has_pending() && self.conflicts.is_empty() {
                final_save = true;
                self.start_save();
                continue;
            }
            break;
        }
        self.waiters.append(&mut self.next_waiters);
        self.reply_waiters(None);

        self.presence.leave().await;
        for sup in [self.channel_sup.take(), self.stream_sup.take()]
            .into_iter()
            .flatten()
        {
            sup.shutdown().await;
        }
        self.debouncer.shutdown().await;
        log::info!("closed session for {} {}", self.doc_type, self.doc_id);
    }

    fn transition(&mut self, event: SaveEvent) {
        let current = self.status();
        match current.apply(event) {
            Ok(next) if next != current => {
                self.snapshot.send_modify(|s| s.status = next);
                log::debug!("{}: {current} -> {next}", self.doc_id);
                self.emit(SessionEvent::Status(next));
            }
            Ok(_) => {}
            Err(e) => log::debug!("{}: ignored {e}", self.doc_id),
        }
    }

    fn status(&self) -> SaveStatus {
        self.snapshot.borrow().status
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
            log::warn!("session event buffer full for {}, dropping event", self.doc_id);
        }
    }

    fn reply_waiters(&mut self, result: Option<SaveResult>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn queued_entries(&self) -> Vec<QueuedSave> {
        let Some(queue) = self.executor.queue() else {
            return Vec::new();
        };
        queue.list_for_document(self.doc_id).unwrap_or_else(|e| {
            log::error!("failed to read offline queue: {e}");
            Vec::new()
        })
    }

    fn has_queued(&self) -> bool {
        !self.queued_entries().is_empty()
    }
}

async fn join_in_flight(slot: &mut Option<JoinHandle<Option<Completion>>>) -> Option<Completion> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *slot = None;
    match joined {
        Ok(done) => done,
        Err(e) => {
            log::error!("save task failed: {e}");
            None
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
