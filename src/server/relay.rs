//! Live-connection table and store-and-forward signal delivery.
//!
//! Delivery is fire-and-forget: an unreachable recipient is not an error to
//! the sender. Per-(from,to) FIFO holds because each sender's events are
//! handled sequentially in its read loop and each recipient drains a single
//! ordered queue in its writer task.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ServerEvent;

/// `connection_id -> outbound queue` for every live transport connection.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<String, mpsc::UnboundedSender<ServerEvent>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connection_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.peers.insert(connection_id.to_owned(), tx);
    }

    pub fn unregister(&mut self, connection_id: &str) {
        self.peers.remove(connection_id);
    }

    /// Delivers the event verbatim if the recipient is live. Returns whether
    /// it was delivered; a dead recipient is a silent drop.
    pub fn forward(&self, to: &str, event: ServerEvent) -> bool {
        match self.peers.get(to) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(to, "dropping signal for connection that is not live");
                false
            }
        }
    }

    /// Fans an event out to a set of recipients, skipping dead ones.
    pub fn broadcast<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a String>,
        event: &ServerEvent,
    ) {
        for id in recipients {
            self.forward(id, event.clone());
        }
    }

    pub fn is_live(&self, connection_id: &str) -> bool {
        self.peers.contains_key(connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_to_dead_connection_is_silent() {
        let mut table = PeerTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.register("a", tx);

        assert!(table.forward(
            "a",
            ServerEvent::ParticipantJoined {
                connection_id: "b".into()
            }
        ));
        assert!(rx.try_recv().is_ok());

        assert!(!table.forward(
            "gone",
            ServerEvent::ParticipantJoined {
                connection_id: "b".into()
            }
        ));

        table.unregister("a");
        assert!(!table.is_live("a"));
        assert!(!table.forward(
            "a",
            ServerEvent::ParticipantLeft {
                connection_id: "b".into()
            }
        ));
    }
}
