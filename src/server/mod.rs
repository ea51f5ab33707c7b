//! Signaling coordinator: WebSocket accept loop, per-connection handlers,
//! room membership fan-out and signal relay.
//!
//! Each accepted connection gets a coordinator-issued id valid for the
//! lifetime of its transport connection, one writer task draining an ordered
//! outbound queue, and a read loop that dispatches protocol events. The
//! disconnect sweep runs whenever the read loop ends, so abrupt network loss
//! and polite goodbyes take the same path.

pub mod registry;
pub mod relay;

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ClientEvent, ServerEvent};
use registry::{AllowAll, RoomAuthorizer, RoomRegistry};
use relay::PeerTable;

/// The signaling coordinator. Purely in-memory; holds no state beyond the
/// lifetime of the connections and rooms it is currently serving.
pub struct Coordinator {
    registry: Mutex<RoomRegistry>,
    peers: Mutex<PeerTable>,
    authorizer: Arc<dyn RoomAuthorizer>,
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        Self::with_authorizer(Arc::new(AllowAll))
    }

    pub fn with_authorizer(authorizer: Arc<dyn RoomAuthorizer>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(RoomRegistry::new()),
            peers: Mutex::new(PeerTable::new()),
            authorizer,
        })
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "coordinator listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = coordinator.handle_connection(stream, addr).await {
                    debug!(%addr, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();
        let connection_id = Uuid::new_v4().to_string();
        info!(%addr, %connection_id, "connection established");

        // One writer task per connection keeps delivery order identical to
        // queue order, which is what gives per-(from,to) FIFO.
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        self.peers.lock().await.register(&connection_id, tx);
        let writer_id = connection_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(connection_id = %writer_id, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = read.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(%connection_id, error = %e, "read error, closing");
                    break;
                }
            };
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.handle_event(&connection_id, event).await,
                    Err(e) => {
                        warn!(%connection_id, error = %e, "undecodable frame dropped");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.handle_disconnect(&connection_id).await;
        writer.abort();
        info!(%connection_id, "connection closed");
        Ok(())
    }

    async fn handle_event(&self, connection_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::RoomJoin { room_id } => {
                if !self.authorizer.allow_join(connection_id, &room_id).await {
                    warn!(connection_id, %room_id, "join rejected by authorizer");
                    self.peers.lock().await.forward(
                        connection_id,
                        ServerEvent::Error {
                            message: format!("join to room {room_id} rejected"),
                        },
                    );
                    return;
                }
                let others = self.registry.lock().await.join(connection_id, &room_id);
                debug!(connection_id, %room_id, members = others.len() + 1, "joined room");
                let peers = self.peers.lock().await;
                peers.forward(
                    connection_id,
                    ServerEvent::RoomJoined {
                        room_id,
                        connection_id: connection_id.to_owned(),
                        peers: others.clone(),
                    },
                );
                peers.broadcast(
                    &others,
                    &ServerEvent::ParticipantJoined {
                        connection_id: connection_id.to_owned(),
                    },
                );
            }
            ClientEvent::RoomLeave { room_id } => {
                let remaining = self.registry.lock().await.leave(connection_id, &room_id);
                if let Some(remaining) = remaining {
                    debug!(connection_id, %room_id, "left room");
                    self.peers.lock().await.broadcast(
                        &remaining,
                        &ServerEvent::ParticipantLeft {
                            connection_id: connection_id.to_owned(),
                        },
                    );
                }
            }
            signal => {
                let Some(to) = signal.signal_target().map(str::to_owned) else {
                    return;
                };
                let Some(delivery) = signal.into_delivery(connection_id) else {
                    return;
                };
                self.peers.lock().await.forward(&to, delivery);
            }
        }
    }

    /// Transport-level disconnect: remove the connection from every room it
    /// was in and notify the remaining members of each.
    async fn handle_disconnect(&self, connection_id: &str) {
        self.peers.lock().await.unregister(connection_id);
        let swept = self.registry.lock().await.disconnect(connection_id);
        if swept.is_empty() {
            return;
        }
        let peers = self.peers.lock().await;
        for (room_id, remaining) in swept {
            debug!(connection_id, %room_id, "disconnect sweep left room");
            peers.broadcast(
                &remaining,
                &ServerEvent::ParticipantLeft {
                    connection_id: connection_id.to_owned(),
                },
            );
        }
    }
}
