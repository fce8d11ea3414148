//! Presence tracking for one document channel.
//!
//! ```text
//! focus / cursor move
//!       │
//!       ▼
//! PresenceTracker::track()      (trailing-edge gate, one update/interval)
//!       │
//!       ▼
//! ChannelLink::track()  ──►  hub  ──►  ChannelEvent::Presence(full roster)
//!                                              │
//!                                              ▼
//!                              PresenceTracker::apply_roster()
//! ```
//!
//! The tracker has no task of its own. Its owner (the session worker)
//! calls [`flush_due`](PresenceTracker::flush_due) at
//! [`deadline`](PresenceTracker::deadline) and
//! [`heartbeat`](PresenceTracker::heartbeat) at
//! [`next_heartbeat`](PresenceTracker::next_heartbeat), so ordering between
//! throttled updates and an immediate `clear()` is never in doubt.

use std::sync::Arc;

use backline_core::{PresenceState, PresenceUser, UserId};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::channel::ChannelLink;
use crate::config::PresenceConfig;
use crate::scheduler::TrailingGate;

pub struct PresenceTracker {
    me: PresenceUser,
    config: PresenceConfig,
    gate: TrailingGate<PresenceUser>,
    link: Option<Arc<dyn ChannelLink>>,
    roster: watch::Sender<Vec<PresenceUser>>,
    last_heartbeat: Instant,
    /// Whether this member currently has a presence entry.
    tracked: bool,
}

impl PresenceTracker {
    pub fn new(me: PresenceUser, config: PresenceConfig) -> Self {
        let (roster, _) = watch::channel(Vec::new());
        Self {
            me,
            gate: TrailingGate::new(config.throttle()),
            config,
            link: None,
            roster,
            last_heartbeat: Instant::now(),
            tracked: false,
        }
    }

    /// Use `link` from now on. If this member was tracked before the link
    /// changed, its state is re-sent at once.
    pub async fn attach(&mut self, link: Arc<dyn ChannelLink>) {
        self.link = Some(link);
        if self.tracked {
            self.me.last_active = Utc::now();
            self.gate.sent_now(Instant::now());
            self.send(self.me.clone()).await;
        }
    }

    /// The link is gone. The roster keeps its last known value.
    pub fn detach(&mut self) {
        self.link = None;
        self.gate.cancel();
    }

    /// Update this user's state. Sent now if the interval allows, otherwise
    /// held as the pending value (replacing any older one).
    pub async fn track(&mut self, state: PresenceState) {
        self.me.apply_state(&state);
        self.tracked = true;
        if let Some(user) = self.gate.offer(self.me.clone(), Instant::now()) {
            self.send(user).await;
        }
    }

    /// When a held update becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.gate.deadline()
    }

    /// Send the held update if its interval has passed.
    pub async fn flush_due(&mut self) {
        if let Some(user) = self.gate.due(Instant::now()) {
            self.send(user).await;
        }
    }

    pub fn next_heartbeat(&self) -> Instant {
        self.last_heartbeat + self.config.heartbeat_interval()
    }

    /// Re-send the current state so peers see this user as active.
    pub async fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        if !self.tracked || self.link.is_none() {
            return;
        }
        self.me.last_active = Utc::now();
        if let Some(user) = self.gate.offer(self.me.clone(), Instant::now()) {
            self.send(user).await;
        }
    }

    /// Blank the editing field and cursor immediately, bypassing the gate.
    pub async fn clear(&mut self) {
        self.me.apply_state(&PresenceState::default());
        self.gate.sent_now(Instant::now());
        if self.tracked {
            self.send(self.me.clone()).await;
        }
    }

    /// Clear, then remove this member from the roster.
    pub async fn leave(&mut self) {
        self.clear().await;
        self.tracked = false;
        if let Some(link) = &self.link {
            if let Err(e) = link.untrack().await {
                log::debug!("presence untrack failed: {e}");
            }
        }
    }

    /// Replace the roster with a full resync from the channel, dropping
    /// peers that have been silent past the idle timeout.
    pub fn apply_roster(&mut self, roster: Vec<PresenceUser>) {
        let roster = self.without_idle(roster);
        self.roster.send_replace(roster);
    }

    /// Drop idle peers from the current roster. Returns the users removed.
    pub fn sweep_idle(&mut self) -> Vec<UserId> {
        let current = self.roster.borrow().clone();
        let before: Vec<UserId> = current.iter().map(|u| u.user_id).collect();
        let kept = self.without_idle(current);
        if kept.len() == before.len() {
            return Vec::new();
        }
        let removed = before
            .into_iter()
            .filter(|id| !kept.iter().any(|u| u.user_id == *id))
            .collect();
        self.roster.send_replace(kept);
        removed
    }

    pub fn roster(&self) -> Vec<PresenceUser> {
        self.roster.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceUser>> {
        self.roster.subscribe()
    }

    pub fn me(&self) -> &PresenceUser {
        &self.me
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    fn without_idle(&self, roster: Vec<PresenceUser>) -> Vec<PresenceUser> {
        let timeout = chrono::Duration::from_std(self.config.idle_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return roster;
        };
        roster
            .into_iter()
            .filter(|user| user.user_id == self.me.user_id || user.last_active >= cutoff)
            .collect()
    }

    async fn send(&self, user: PresenceUser) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(e) = link.track(user).await {
            log::debug!("presence track failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalHub;
    use crate::channel::{ChannelEvent, ChannelHandle, EventFilter, PubSub};
    use crate::protocol::MemberInfo;
    use std::time::Duration;
    use uuid::Uuid;

    async fn open(hub: &LocalHub, name: &str) -> (PresenceUser, ChannelHandle) {
        let user = PresenceUser::new(Uuid::new_v4(), name);
        let handle = hub
            .open_channel(
                "stage_plots:doc",
                MemberInfo::new(user.user_id, name),
                EventFilter::PRESENCE,
            )
            .await
            .unwrap();
        (user, handle)
    }

    fn drain(handle: &mut ChannelHandle) -> Vec<Vec<PresenceUser>> {
        let mut rosters = Vec::new();
        while let Ok(ChannelEvent::Presence(roster)) = handle.events.try_recv() {
            rosters.push(roster);
        }
        rosters
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_is_throttled_with_trailing_value() {
        let hub = LocalHub::default();
        let (me, handle) = open(&hub, "ana").await;
        let (_, mut watcher) = open(&hub, "ben").await;
        tokio::task::yield_now().await;
        drain(&mut watcher);

        let mut tracker = PresenceTracker::new(me, PresenceConfig::for_testing());
        tracker.attach(handle.link.clone()).await;

        tracker.track(PresenceState::editing("title", Some(1))).await;
        tracker.track(PresenceState::editing("title", Some(2))).await;
        tracker.track(PresenceState::editing("title", Some(3))).await;
        tokio::task::yield_now().await;

        let rosters = drain(&mut watcher);
        assert_eq!(rosters.len(), 1);
        assert_eq!(rosters[0][0].cursor, Some(1));

        let deadline = tracker.deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        tracker.flush_due().await;
        tokio::task::yield_now().await;

        let rosters = drain(&mut watcher);
        assert_eq!(rosters.len(), 1);
        assert_eq!(rosters[0][0].cursor, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_bypasses_throttle_then_leave() {
        let hub = LocalHub::default();
        let (me, handle) = open(&hub, "ana").await;
        let mut tracker = PresenceTracker::new(me, PresenceConfig::for_testing());
        tracker.attach(handle.link.clone()).await;

        tracker.track(PresenceState::editing("inputs", Some(4))).await;
        tracker.track(PresenceState::editing("inputs", Some(5))).await;
        tracker.clear().await;

        let roster = hub.roster("stage_plots:doc").await;
        assert_eq!(roster.len(), 1);
        assert!(roster[0].state().is_idle());
        assert!(tracker.deadline().is_none());

        tracker.leave().await;
        assert!(hub.roster("stage_plots:doc").await.is_empty());
        assert!(!tracker.is_tracked());
    }

    #[tokio::test]
    async fn test_apply_roster_replaces_and_drops_idle() {
        let me = PresenceUser::new(Uuid::new_v4(), "ana");
        let mut tracker = PresenceTracker::new(me.clone(), PresenceConfig::for_testing());

        let fresh = PresenceUser::new(Uuid::new_v4(), "ben");
        let mut stale = PresenceUser::new(Uuid::new_v4(), "cat");
        stale.last_active = Utc::now() - chrono::Duration::minutes(5);

        tracker.apply_roster(vec![me.clone(), fresh.clone(), stale]);
        let ids: Vec<_> = tracker.roster().iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![me.user_id, fresh.user_id]);

        tracker.apply_roster(vec![me.clone()]);
        assert_eq!(tracker.roster().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let me = PresenceUser::new(Uuid::new_v4(), "ana");
        let mut tracker = PresenceTracker::new(me.clone(), PresenceConfig::for_testing());
        let peer = PresenceUser::new(Uuid::new_v4(), "ben");
        tracker.apply_roster(vec![me, peer.clone()]);
        assert!(tracker.sweep_idle().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(tracker.sweep_idle(), vec![peer.user_id]);
        assert_eq!(tracker.roster().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_resends_state() {
        let hub = LocalHub::default();
        let (me, first) = open(&hub, "ana").await;
        let mut tracker = PresenceTracker::new(me.clone(), PresenceConfig::for_testing());
        tracker.attach(first.link.clone()).await;
        tracker.track(PresenceState::editing("title", None)).await;

        first.link.close().await;
        tracker.detach();
        assert!(hub.roster("stage_plots:doc").await.is_empty());

        let second = hub
            .open_channel(
                "stage_plots:doc",
                MemberInfo::new(me.user_id, "ana"),
                EventFilter::PRESENCE,
            )
            .await
            .unwrap();
        tracker.attach(second.link.clone()).await;

        let roster = hub.roster("stage_plots:doc").await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].editing_field.as_deref(), Some("title"));
    }
}
