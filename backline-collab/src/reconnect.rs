//! Supervision of long-lived subscriptions.
//!
//! ```text
//!              ok                     error / timeout / closed
//! Connecting ──────► Connected ─────────────────────────────► Reconnecting
//!     │                  ▲                                      │    │
//!     │ error/timeout    └────────── ok ────────────────────────┘    │ retries
//!     └──────────────────────────────► Reconnecting                  ▼ exhausted
//!                                                                  Error
//!             shutdown (any) ──► Disconnected
//! ```
//!
//! A [`Supervisor`] owns one [`Connect`] implementation. The old link is
//! torn down before every new attempt, and the wait between attempts is
//! `min(initial · 2^attempt, max)` plus random jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backline_core::ConnectionStatus;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelError, ChannelEvent, ChannelLink, EventFilter, PubSub};
use crate::config::ReconnectConfig;
use crate::protocol::MemberInfo;
use crate::store::{ChangeStream, RowChange, RowEvent, RowFilter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Upper bound of the random addition, as a fraction of the base delay.
    pub jitter: f64,
    pub subscribe_timeout: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            max_retries: config.max_retries,
            jitter: config.jitter,
            subscribe_timeout: config.subscribe_timeout(),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

/// Something that can be (re)subscribed.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Link: Clone + Send + Sync + 'static;
    type Event: Send + 'static;

    /// Open a fresh subscription. Must not return before it is confirmed.
    async fn connect(&self) -> Result<(Self::Link, mpsc::Receiver<Self::Event>), ChannelError>;

    /// Whether `event` reports that the subscription died.
    fn is_failure(&self, _event: &Self::Event) -> bool {
        false
    }

    async fn teardown(&self, _link: Self::Link) {}

    fn describe(&self) -> String;
}

#[derive(Debug)]
pub enum LinkEvent<L, E> {
    /// A subscription was confirmed. `resumed` is true after the first one.
    Up { link: L, resumed: bool },
    Event(E),
    /// The current subscription is gone; a new attempt follows unless the
    /// supervisor is shutting down.
    Down,
}

enum Command {
    Reconnect,
    Shutdown,
}

enum Ended {
    Failed,
    Manual,
    Shutdown,
}

pub struct Supervisor {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl Supervisor {
    pub fn spawn<C: Connect>(
        connector: C,
        policy: ReconnectPolicy,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<LinkEvent<C::Link, C::Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let task = tokio::spawn(supervise(connector, policy, rx, events_tx, status_tx));
        (Self { tx, status, task }, events_rx)
    }

    /// Drop the current subscription (if any), reset the attempt counter and
    /// try again now. Also leaves the `Error` state.
    pub fn reconnect(&self) {
        let _ = self.tx.send(Command::Reconnect);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

async fn supervise<C: Connect>(
    connector: C,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<LinkEvent<C::Link, C::Event>>,
    status: watch::Sender<ConnectionStatus>,
) {
    let name = connector.describe();
    let mut attempt: u32 = 0;
    let mut connected_before = false;

    'outer: loop {
        let outcome = tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(Command::Reconnect) => {
                    attempt = 0;
                    continue;
                }
                Some(Command::Shutdown) | None => break,
            },
            res = tokio::time::timeout(policy.subscribe_timeout, connector.connect()) => {
                res.unwrap_or(Err(ChannelError::Timeout(policy.subscribe_timeout)))
            }
        };

        match outcome {
            Ok((link, mut rx)) => {
                attempt = 0;
                status.send_replace(ConnectionStatus::Connected);
                log::info!("{name}: connected");

                let up = LinkEvent::Up {
                    link: link.clone(),
                    resumed: connected_before,
                };
                connected_before = true;
                if events.send(up).await.is_err() {
                    connector.teardown(link).await;
                    break;
                }

                let ended = loop {
                    tokio::select! {
                        biased;
                        cmd = commands.recv() => match cmd {
                            Some(Command::Reconnect) => break Ended::Manual,
                            Some(Command::Shutdown) | None => break Ended::Shutdown,
                        },
                        event = rx.recv() => match event {
                            Some(event) => {
                                let failed = connector.is_failure(&event);
                                if events.send(LinkEvent::Event(event)).await.is_err() {
                                    break Ended::Shutdown;
                                }
                                if failed {
                                    break Ended::Failed;
                                }
                            }
                            None => break Ended::Failed,
                        },
                    }
                };

                let _ = events.send(LinkEvent::Down).await;
                connector.teardown(link).await;
                match ended {
                    Ended::Shutdown => break,
                    Ended::Manual => {
                        log::info!("{name}: manual reconnect");
                        status.send_replace(ConnectionStatus::Reconnecting);
                        continue;
                    }
                    Ended::Failed => {
                        log::warn!("{name}: subscription lost");
                        status.send_replace(ConnectionStatus::Reconnecting);
                    }
                }
            }
            Err(e) => {
                log::warn!("{name}: connect attempt {attempt} failed: {e}");
                status.send_replace(ConnectionStatus::Reconnecting);
            }
        }

        if attempt >= policy.max_retries {
            log::error!("{name}: giving up after {attempt} retries");
            status.send_replace(ConnectionStatus::Error);
            match commands.recv().await {
                Some(Command::Reconnect) => {
                    attempt = 0;
                    status.send_replace(ConnectionStatus::Reconnecting);
                    continue;
                }
                Some(Command::Shutdown) | None => break,
            }
        }

        let delay = policy.delay(attempt);
        attempt += 1;
        log::debug!("{name}: retry {attempt}/{} in {delay:?}", policy.max_retries);
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(Command::Reconnect) => attempt = 0,
                Some(Command::Shutdown) | None => break 'outer,
            },
            _ = tokio::time::sleep(delay) => {}
        }
    }

    status.send_replace(ConnectionStatus::Disconnected);
    log::debug!("{name}: supervisor stopped");
}

/// Resubscribes a pub/sub channel.
pub struct ChannelConnector {
    pubsub: Arc<dyn PubSub>,
    name: String,
    member: MemberInfo,
    filter: EventFilter,
}

impl ChannelConnector {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        name: impl Into<String>,
        member: MemberInfo,
        filter: EventFilter,
    ) -> Self {
        Self {
            pubsub,
            name: name.into(),
            member,
            filter,
        }
    }
}

#[async_trait]
impl Connect for ChannelConnector {
    type Link = Arc<dyn ChannelLink>;
    type Event = ChannelEvent;

    async fn connect(&self) -> Result<(Self::Link, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let handle = self
            .pubsub
            .open_channel(&self.name, self.member.clone(), self.filter)
            .await?;
        Ok((handle.link, handle.events))
    }

    fn is_failure(&self, event: &ChannelEvent) -> bool {
        matches!(event, ChannelEvent::Error(_))
    }

    async fn teardown(&self, link: Self::Link) {
        link.close().await;
    }

    fn describe(&self) -> String {
        format!("channel {}", self.name)
    }
}

/// Resubscribes a store change stream.
pub struct StreamConnector {
    stream: Arc<dyn ChangeStream>,
    table: String,
    event: RowEvent,
    filter: RowFilter,
}

impl StreamConnector {
    pub fn new(
        stream: Arc<dyn ChangeStream>,
        table: impl Into<String>,
        event: RowEvent,
        filter: RowFilter,
    ) -> Self {
        Self {
            stream,
            table: table.into(),
            event,
            filter,
        }
    }
}

#[async_trait]
impl Connect for StreamConnector {
    type Link = ();
    type Event = RowChange;

    async fn connect(&self) -> Result<((), mpsc::Receiver<RowChange>), ChannelError> {
        let rx = self
            .stream
            .subscribe(&self.table, self.event, self.filter)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        Ok(((), rx))
    }

    fn describe(&self) -> String {
        format!("change stream {}", self.table)
    }
}
