//! In-process pub/sub hub.
//!
//! Each channel name maps to one room backed by a tokio broadcast channel,
//! so a publish is a single send regardless of member count. Every member
//! gets a forwarding task that drops its own broadcasts, applies the
//! member's [`EventFilter`] and hands events to the member's queue.
//!
//! Presence is room state: any join, leave or track re-announces the full
//! roster to every member.
//!
//! The relay server exposes a hub over WebSocket; tests use one directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backline_core::PresenceUser;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelLink, EventFilter, PubSub,
};
use crate::config::ChannelConfig;
use crate::protocol::{BroadcastMessage, MemberInfo};

/// Snapshot of hub activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub channels: usize,
    pub members: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

enum HubMessage {
    Broadcast {
        sender: MemberInfo,
        message: BroadcastMessage,
    },
    Presence(Vec<PresenceUser>),
    Kick(String),
}

struct RoomMember {
    info: MemberInfo,
    presence: Option<PresenceUser>,
    joined: u64,
}

struct Room {
    sender: broadcast::Sender<Arc<HubMessage>>,
    members: RwLock<HashMap<Uuid, RoomMember>>,
    next_seq: AtomicU64,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    async fn roster(&self) -> Vec<PresenceUser> {
        let members = self.members.read().await;
        let mut tracked: Vec<&RoomMember> =
            members.values().filter(|m| m.presence.is_some()).collect();
        tracked.sort_by_key(|m| m.joined);
        tracked
            .into_iter()
            .filter_map(|m| m.presence.clone())
            .collect()
    }

    async fn announce_roster(&self) {
        let roster = self.roster().await;
        let _ = self.sender.send(Arc::new(HubMessage::Presence(roster)));
    }
}

/// Room registry. Cheap to clone; clones share rooms.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    config: ChannelConfig,
    available: Arc<AtomicBool>,
    stats: Arc<AtomicHubStats>,
}

impl LocalHub {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            available: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    async fn get_or_create(&self, name: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(self.config.capacity)))
            .clone()
    }

    async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.members.read().await.is_empty() {
                rooms.remove(name);
                return true;
            }
        }
        false
    }

    /// While unavailable, opens and publishes fail as if the network were
    /// down. Existing subscriptions are untouched; see [`kick_all`](Self::kick_all).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Terminate every subscription in every channel.
    pub async fn kick_all(&self, reason: &str) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        let mut kicked = 0;
        for room in rooms {
            let mut members = room.members.write().await;
            kicked += members.len();
            members.clear();
            let _ = room
                .sender
                .send(Arc::new(HubMessage::Kick(reason.to_string())));
        }
        log::info!("hub: kicked {kicked} members ({reason})");
        kicked
    }

    pub async fn roster(&self, name: &str) -> Vec<PresenceUser> {
        match self.rooms.read().await.get(name) {
            Some(room) => room.roster().await,
            None => Vec::new(),
        }
    }

    pub async fn member_count(&self, name: &str) -> usize {
        match self.rooms.read().await.get(name) {
            Some(room) => room.members.read().await.len(),
            None => 0,
        }
    }

    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.read().await;
        let mut members = 0;
        for room in rooms.values() {
            members += room.members.read().await.len();
        }
        HubStats {
            channels: rooms.len(),
            members,
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl PubSub for LocalHub {
    async fn open_channel(
        &self,
        name: &str,
        member: MemberInfo,
        filter: EventFilter,
    ) -> Result<ChannelHandle, ChannelError> {
        if !self.is_available() {
            return Err(ChannelError::Unavailable("hub offline".into()));
        }

        let room = self.get_or_create(name).await;
        // Subscribe before joining so the join roster reaches the newcomer.
        let rx = room.sender.subscribe();
        {
            let mut members = room.members.write().await;
            members.insert(
                member.member_id,
                RoomMember {
                    info: member.clone(),
                    presence: None,
                    joined: room.next_seq.fetch_add(1, Ordering::Relaxed),
                },
            );
        }

        let (tx, events) = mpsc::channel(self.config.event_buffer);
        let task = tokio::spawn(forward(
            rx,
            tx,
            member.member_id,
            filter,
            self.stats.clone(),
        ));

        log::debug!("hub: {} joined {name}", member.display_name);
        room.announce_roster().await;

        let link = LocalLink {
            hub: self.clone(),
            room,
            name: name.to_string(),
            member,
            task: Mutex::new(Some(task)),
        };
        Ok(ChannelHandle {
            link: Arc::new(link),
            events,
        })
    }
}

async fn forward(
    mut rx: broadcast::Receiver<Arc<HubMessage>>,
    tx: mpsc::Sender<ChannelEvent>,
    me: Uuid,
    filter: EventFilter,
    stats: Arc<AtomicHubStats>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(msg) => match &*msg {
                HubMessage::Broadcast { sender, .. } if sender.member_id == me => continue,
                HubMessage::Broadcast { sender, message } => ChannelEvent::Broadcast {
                    sender: sender.clone(),
                    message: message.clone(),
                },
                HubMessage::Presence(roster) => ChannelEvent::Presence(roster.clone()),
                HubMessage::Kick(reason) => {
                    let _ = tx.send(ChannelEvent::Error(reason.clone())).await;
                    break;
                }
            },
            Err(RecvError::Lagged(n)) => {
                stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                log::warn!("hub: member {me} lagged, dropped {n} messages");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if filter.accepts(&event) && tx.send(event).await.is_err() {
            break;
        }
    }
}

struct LocalLink {
    hub: LocalHub,
    room: Arc<Room>,
    name: String,
    member: MemberInfo,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalLink {
    fn check_open(&self) -> Result<(), ChannelError> {
        if self.hub.is_available() {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("hub offline".into()))
        }
    }
}

#[async_trait]
impl ChannelLink for LocalLink {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), ChannelError> {
        self.check_open()?;
        if !self
            .room
            .members
            .read()
            .await
            .contains_key(&self.member.member_id)
        {
            return Err(ChannelError::Closed);
        }
        let receivers = self
            .room
            .sender
            .send(Arc::new(HubMessage::Broadcast {
                sender: self.member.clone(),
                message: message.clone(),
            }))
            .unwrap_or(0);
        self.hub.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "hub: {} published {} to {} ({receivers} receivers)",
            self.member.display_name,
            message.kind(),
            self.name
        );
        Ok(())
    }

    async fn track(&self, user: PresenceUser) -> Result<(), ChannelError> {
        self.check_open()?;
        {
            let mut members = self.room.members.write().await;
            let entry = members
                .get_mut(&self.member.member_id)
                .ok_or(ChannelError::Closed)?;
            entry.presence = Some(user);
        }
        self.room.announce_roster().await;
        Ok(())
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        {
            let mut members = self.room.members.write().await;
            let entry = members
                .get_mut(&self.member.member_id)
                .ok_or(ChannelError::Closed)?;
            entry.presence = None;
        }
        self.room.announce_roster().await;
        Ok(())
    }

    async fn presence_snapshot(&self) -> Result<Vec<PresenceUser>, ChannelError> {
        Ok(self.room.roster().await)
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        let removed = self
            .room
            .members
            .write()
            .await
            .remove(&self.member.member_id);
        if let Some(member) = removed {
            log::debug!("hub: {} left {}", member.info.display_name, self.name);
            self.room.announce_roster().await;
            self.hub.remove_if_empty(&self.name).await;
        }
    }

    fn member(&self) -> &MemberInfo {
        &self.member
    }
}
