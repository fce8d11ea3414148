//! WebSocket transport for [`PubSub`], talking to a [`RelayServer`].
//!
//! Each `open_channel` call dials its own socket, sends `Join` and waits for
//! `Joined`. Two tasks then own the socket halves:
//!
//! - writer: drains the link's outgoing frame queue onto the socket
//! - reader: decodes relay frames into [`ChannelEvent`]s and caches the
//!   latest roster for [`ChannelLink::presence_snapshot`]
//!
//! When the socket drops, the reader exits and the handle's event receiver
//! closes, which is how a [`Supervisor`](crate::reconnect::Supervisor)
//! notices the loss.
//!
//! [`RelayServer`]: crate::server::RelayServer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backline_core::PresenceUser;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{ChannelError, ChannelEvent, ChannelHandle, ChannelLink, EventFilter, PubSub};
use crate::protocol::{BroadcastMessage, Frame, MemberInfo, ProtocolError};

/// Dials a relay at `url` (e.g. `ws://127.0.0.1:9090`).
#[derive(Debug, Clone)]
pub struct WsPubSub {
    url: String,
    join_timeout: Duration,
    event_buffer: usize,
}

impl WsPubSub {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PubSub for WsPubSub {
    async fn open_channel(
        &self,
        name: &str,
        member: MemberInfo,
        filter: EventFilter,
    ) -> Result<ChannelHandle, ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = Frame::Join {
            channel: name.to_string(),
            member: member.clone(),
        };
        ws_writer
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let ack = tokio::time::timeout(self.join_timeout, async {
            loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        return Frame::decode(&data).map_err(ChannelError::from)
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ChannelError::Unavailable(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| ChannelError::Timeout(self.join_timeout))??;

        match ack {
            Frame::Joined => {}
            Frame::Error { message } => return Err(ChannelError::Remote(message)),
            _ => return Err(ProtocolError::UnexpectedFrame("expected joined").into()),
        }
        log::debug!("ws: {} joined {name} via {}", member.display_name, self.url);

        // Writer task: forward queued frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let data = match frame.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        log::warn!("ws: dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: relay frames to channel events
        let roster = Arc::new(RwLock::new(Vec::new()));
        let (event_tx, events) = mpsc::channel(self.event_buffer);
        let cached = roster.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let event = match Frame::decode(&data) {
                    Ok(Frame::Event { sender, payload }) => {
                        match BroadcastMessage::from_payload(&payload) {
                            Ok(message) => ChannelEvent::Broadcast { sender, message },
                            Err(e) => {
                                log::warn!("ws: bad broadcast from {}: {e}", sender.display_name);
                                continue;
                            }
                        }
                    }
                    Ok(Frame::Presence { roster }) => {
                        *cached.write().await = roster.clone();
                        ChannelEvent::Presence(roster)
                    }
                    Ok(Frame::Error { message }) => {
                        let _ = event_tx.send(ChannelEvent::Error(message)).await;
                        break;
                    }
                    Ok(Frame::Pong) => continue,
                    Ok(other) => {
                        log::debug!("ws: ignoring frame {other:?}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("ws: undecodable frame: {e}");
                        continue;
                    }
                };
                if filter.accepts(&event) && event_tx.send(event).await.is_err() {
                    break;
                }
            }
            log::debug!("ws: reader finished");
        });

        let link = WsLink {
            member,
            outgoing: Mutex::new(Some(out_tx)),
            roster,
            reader: Mutex::new(Some(reader)),
        };
        Ok(ChannelHandle {
            link: Arc::new(link),
            events,
        })
    }
}

struct WsLink {
    member: MemberInfo,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    roster: Arc<RwLock<Vec<PresenceUser>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsLink {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let tx = self
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or(ChannelError::Closed)?;
        tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl ChannelLink for WsLink {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), ChannelError> {
        self.send(Frame::publish(message)?).await
    }

    async fn track(&self, user: PresenceUser) -> Result<(), ChannelError> {
        self.send(Frame::Track { user }).await
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        self.send(Frame::Untrack).await
    }

    async fn presence_snapshot(&self) -> Result<Vec<PresenceUser>, ChannelError> {
        if self.outgoing.lock().await.is_none() {
            return Err(ChannelError::Closed);
        }
        Ok(self.roster.read().await.clone())
    }

    async fn close(&self) {
        // Dropping the sender ends the writer, which closes the socket.
        self.outgoing.lock().await.take();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }

    fn member(&self) -> &MemberInfo {
        &self.member
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn member() -> MemberInfo {
        MemberInfo::new(Uuid::new_v4(), "Dana")
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pubsub = WsPubSub::new(format!("ws://{addr}"));
        let err = pubsub
            .open_channel("stage_plots:1", member(), EventFilter::ALL)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_silent_relay_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Hold the socket open without answering the join.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        });

        let pubsub =
            WsPubSub::new(format!("ws://{addr}")).with_join_timeout(Duration::from_millis(100));
        let err = pubsub
            .open_channel("stage_plots:1", member(), EventFilter::ALL)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_refused_join_is_remote_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _join = ws.next().await;
            let refusal = Frame::Error {
                message: "room full".into(),
            };
            ws.send(Message::Binary(refusal.encode().unwrap().into()))
                .await
                .unwrap();
        });

        let pubsub = WsPubSub::new(format!("ws://{addr}"));
        let err = pubsub
            .open_channel("stage_plots:1", member(), EventFilter::ALL)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Remote("room full".into()));
    }
}
