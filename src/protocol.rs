//! Wire protocol between participants and the coordinator.
//!
//! Every frame is a JSON object tagged by an `event` field. Signal payloads
//! are opaque strings (JSON-serialized session descriptions or candidates);
//! the coordinator relays them verbatim and never inspects their content.

use serde::{Deserialize, Serialize};

/// Events sent by a participant to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin { room_id: String },

    #[serde(rename = "room:leave")]
    RoomLeave { room_id: String },

    #[serde(rename = "signal:offer")]
    Offer { to: String, payload: String },

    #[serde(rename = "signal:answer")]
    Answer { to: String, payload: String },

    #[serde(rename = "signal:renegotiate-offer")]
    RenegotiateOffer { to: String, payload: String },

    #[serde(rename = "signal:renegotiate-answer")]
    RenegotiateAnswer { to: String, payload: String },

    /// Responder-side request that the session initiator start a
    /// renegotiation cycle. Carries the media kinds the responder wants to
    /// send, so the initiator can prepare matching receive transceivers.
    #[serde(rename = "signal:renegotiate-request")]
    RenegotiateRequest {
        to: String,
        #[serde(default)]
        kinds: Vec<String>,
    },

    /// Generic ICE/session signal, relayed opaquely for trickle-capable peers.
    #[serde(rename = "signal:candidate")]
    Candidate { to: String, payload: String },
}

impl ClientEvent {
    /// Recipient of a signal event, if this is one.
    pub fn signal_target(&self) -> Option<&str> {
        match self {
            ClientEvent::Offer { to, .. }
            | ClientEvent::Answer { to, .. }
            | ClientEvent::RenegotiateOffer { to, .. }
            | ClientEvent::RenegotiateAnswer { to, .. }
            | ClientEvent::RenegotiateRequest { to, .. }
            | ClientEvent::Candidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Rewrites an inbound signal into its delivered form, replacing the
    /// addressed recipient with the coordinator-verified sender. Returns
    /// `None` for non-signal events.
    pub fn into_delivery(self, from: &str) -> Option<ServerEvent> {
        let from = from.to_owned();
        match self {
            ClientEvent::Offer { payload, .. } => Some(ServerEvent::Offer { from, payload }),
            ClientEvent::Answer { payload, .. } => Some(ServerEvent::Answer { from, payload }),
            ClientEvent::RenegotiateOffer { payload, .. } => {
                Some(ServerEvent::RenegotiateOffer { from, payload })
            }
            ClientEvent::RenegotiateAnswer { payload, .. } => {
                Some(ServerEvent::RenegotiateAnswer { from, payload })
            }
            ClientEvent::RenegotiateRequest { kinds, .. } => {
                Some(ServerEvent::RenegotiateRequest { from, kinds })
            }
            ClientEvent::Candidate { payload, .. } => {
                Some(ServerEvent::Candidate { from, payload })
            }
            ClientEvent::RoomJoin { .. } | ClientEvent::RoomLeave { .. } => None,
        }
    }
}

/// Events sent by the coordinator to a participant.
///
/// The `from` field on signal events is stamped by the coordinator from the
/// sending connection's identity; clients cannot spoof it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "room:joined")]
    RoomJoined {
        room_id: String,
        connection_id: String,
        peers: Vec<String>,
    },

    #[serde(rename = "participant:joined")]
    ParticipantJoined { connection_id: String },

    #[serde(rename = "participant:left")]
    ParticipantLeft { connection_id: String },

    #[serde(rename = "signal:offer")]
    Offer { from: String, payload: String },

    #[serde(rename = "signal:answer")]
    Answer { from: String, payload: String },

    #[serde(rename = "signal:renegotiate-offer")]
    RenegotiateOffer { from: String, payload: String },

    #[serde(rename = "signal:renegotiate-answer")]
    RenegotiateAnswer { from: String, payload: String },

    #[serde(rename = "signal:renegotiate-request")]
    RenegotiateRequest {
        from: String,
        #[serde(default)]
        kinds: Vec<String>,
    },

    #[serde(rename = "signal:candidate")]
    Candidate { from: String, payload: String },

    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_tagged_wire_names() {
        let join = serde_json::to_value(ClientEvent::RoomJoin {
            room_id: "r1".into(),
        })
        .unwrap();
        assert_eq!(join["event"], "room:join");

        let offer = serde_json::to_value(ClientEvent::Offer {
            to: "b".into(),
            payload: "{}".into(),
        })
        .unwrap();
        assert_eq!(offer["event"], "signal:offer");
        assert_eq!(offer["to"], "b");

        let request = serde_json::to_value(ClientEvent::RenegotiateRequest {
            to: "b".into(),
            kinds: vec!["video".into()],
        })
        .unwrap();
        assert_eq!(request["event"], "signal:renegotiate-request");
        assert_eq!(request["kinds"][0], "video");

        // A request without kinds still decodes; the field defaults empty.
        let bare: ClientEvent =
            serde_json::from_str(r#"{"event":"signal:renegotiate-request","to":"b"}"#).unwrap();
        assert_eq!(
            bare,
            ClientEvent::RenegotiateRequest {
                to: "b".into(),
                kinds: vec![],
            }
        );
    }

    #[test]
    fn server_events_use_tagged_wire_names() {
        let left = serde_json::to_value(ServerEvent::ParticipantLeft {
            connection_id: "c1".into(),
        })
        .unwrap();
        assert_eq!(left["event"], "participant:left");

        let joined = serde_json::to_value(ServerEvent::RoomJoined {
            room_id: "r1".into(),
            connection_id: "c1".into(),
            peers: vec![],
        })
        .unwrap();
        assert_eq!(joined["event"], "room:joined");
    }

    #[test]
    fn delivery_replaces_recipient_with_sender() {
        let event = ClientEvent::Offer {
            to: "b".into(),
            payload: "sdp".into(),
        };
        assert_eq!(event.signal_target(), Some("b"));
        match event.into_delivery("a") {
            Some(ServerEvent::Offer { from, payload }) => {
                assert_eq!(from, "a");
                assert_eq!(payload, "sdp");
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn membership_events_are_not_signals() {
        let event = ClientEvent::RoomLeave {
            room_id: "r1".into(),
        };
        assert_eq!(event.signal_target(), None);
        assert!(event.into_delivery("a").is_none());
    }
}
