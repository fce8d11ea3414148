//! WebSocket relay exposing a [`LocalHub`] to remote sessions.
//!
//! ```text
//! Session A ── ws ──┐
//!                   ├── RelayServer ── LocalHub ── room "stage_plots:<id>"
//! Session B ── ws ──┘                                 │
//!                                                     ├── broadcast fan-out
//!                                                     └── presence roster
//! ```
//!
//! One connection holds exactly one channel membership. The first frame
//! must be `Join`; the relay answers `Joined` once the member is in the
//! room, then maps frames onto [`ChannelLink`](crate::channel::ChannelLink)
//! calls until the socket closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::LocalHub;
use crate::channel::{ChannelEvent, ChannelLink, EventFilter, PubSub};
use crate::config::ChannelConfig;
use crate::protocol::{BroadcastMessage, Frame};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub channel: ChannelConfig,
    /// How long a new connection may take to send `Join`.
    pub join_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel: ChannelConfig::default(),
            join_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

pub struct RelayServer {
    config: ServerConfig,
    hub: LocalHub,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = LocalHub::new(config.channel.clone());
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let join_timeout = self.config.join_timeout;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, join_timeout).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: LocalHub,
        stats: Arc<RwLock<ServerStats>>,
        join_timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let join = match tokio::time::timeout(join_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => Frame::decode(&data).ok(),
            _ => None,
        };
        let Some(Frame::Join { channel, member }) = join else {
            log::warn!("{addr} did not join a channel");
            let refusal = Frame::Error {
                message: "expected join".into(),
            };
            let _ = ws_sender.send(Message::Binary(refusal.encode()?.into())).await;
            stats.write().await.active_connections -= 1;
            return Ok(());
        };

        let mut handle = match hub.open_channel(&channel, member.clone(), EventFilter::ALL).await {
            Ok(handle) => handle,
            Err(e) => {
                let refusal = Frame::Error {
                    message: e.to_string(),
                };
                ws_sender
                    .send(Message::Binary(refusal.encode()?.into()))
                    .await?;
                stats.write().await.active_connections -= 1;
                return Ok(());
            }
        };
        ws_sender
            .send(Message::Binary(Frame::Joined.encode()?.into()))
            .await?;
        log::info!("{} ({addr}) joined {channel}", member.display_name);

        let link = handle.link.clone();
        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let reply = match Frame::decode(&data) {
                                Ok(frame) => Self::apply_frame(frame, link.as_ref()).await,
                                Err(e) => {
                                    stats.write().await.rejected_frames += 1;
                                    log::warn!("bad frame from {addr}: {e}");
                                    Some(Frame::Error { message: e.to_string() })
                                }
                            };
                            if let Some(reply) = reply {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    event = handle.events.recv() => {
                        let frame = match event {
                            Some(ChannelEvent::Broadcast { sender, message }) => Frame::Event {
                                sender,
                                payload: message.to_payload()?,
                            },
                            Some(ChannelEvent::Presence(roster)) => Frame::Presence { roster },
                            Some(ChannelEvent::Error(message)) => {
                                ws_sender.send(Message::Binary(Frame::Error { message }.encode()?.into())).await?;
                                break;
                            }
                            None => break,
                        };
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        link.close().await;
        stats.write().await.active_connections -= 1;
        outcome
    }

    /// Apply one client frame to the member's link. Returns the reply, if any.
    async fn apply_frame(frame: Frame, link: &dyn ChannelLink) -> Option<Frame> {
        let result = match frame {
            Frame::Publish { payload } => match BroadcastMessage::from_payload(&payload) {
                Ok(message) => link.publish(&message).await,
                Err(e) => return Some(Frame::Error { message: e.to_string() }),
            },
            Frame::Track { user } => link.track(user).await,
            Frame::Untrack => link.untrack().await,
            Frame::Ping => return Some(Frame::Pong),
            other => {
                log::debug!("ignoring unexpected frame {other:?}");
                return None;
            }
        };
        result.err().map(|e| Frame::Error {
            message: e.to_string(),
        })
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.channel.capacity, 256);
        assert_eq!(config.join_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.hub().stats().await.channels, 0);
    }
}
