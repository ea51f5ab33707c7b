//! WebSocket client for the signaling coordinator.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ServerEvent};

/// Bidirectional signaling channel to the coordinator. Reading and writing
/// run on their own tasks; both end when the socket closes or the client is
/// dropped.
pub struct SignalingClient {
    tx: mpsc::Sender<ClientEvent>,
    rx: mpsc::Receiver<ServerEvent>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerEvent>(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientEvent>(100);

        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outgoing event");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            // Channel gone: the client was dropped. Close the socket politely
            // so the coordinator's disconnect sweep runs without waiting for
            // a transport timeout.
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(error = %e, "signaling read ended");
                        break;
                    }
                };
                if let Message::Text(text) = msg {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if incoming_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable frame dropped"),
                    }
                }
            }
        });

        Ok(Self {
            tx: outgoing_tx,
            rx: incoming_rx,
        })
    }

    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::ChannelClosed)
    }

    /// Next event from the coordinator, `None` once the transport is gone.
    pub async fn receive(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}
