//! Relay wire format: one JSON object per websocket text message, tagged by
//! `type`. The relay adds `from` when forwarding peer-addressed messages.

use serde::{Deserialize, Serialize};

use crate::core::connection::types::{IceCandidate, SessionDescription};
use crate::core::session::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// First message on every (re)connection.
    Join {
        #[serde(rename = "clientId")]
        client_id: String,
        role: Role,
    },
    /// Current roster of the session, including ourselves.
    Peers {
        #[serde(default)]
        peers: Vec<String>,
    },
    SdpOffer {
        #[serde(default)]
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    SdpAnswer {
        #[serde(default)]
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(default)]
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: IceCandidate,
    },
    /// Keepalive.
    Ping,
    /// The relay's reply to `ping`.
    Pong,
    /// Graceful departure.
    Leave,
    /// Any message type this client does not know.
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn offer(to: &str, sdp: SessionDescription) -> Self {
        Self::SdpOffer {
            to: to.to_string(),
            from: None,
            sdp,
        }
    }

    pub fn answer(to: &str, sdp: SessionDescription) -> Self {
        Self::SdpAnswer {
            to: to.to_string(),
            from: None,
            sdp,
        }
    }

    pub fn candidate(to: &str, candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            to: to.to_string(),
            from: None,
            candidate,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Peers { .. } => "peers",
            Self::SdpOffer { .. } => "sdp-offer",
            Self::SdpAnswer { .. } => "sdp-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Leave => "leave",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let msg = SignalMessage::Join {
            client_id: "c1".into(),
            role: Role::Host,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "join", "clientId": "c1", "role": "host"})
        );
    }

    #[test]
    fn test_outbound_offer_has_no_from() {
        let msg = SignalMessage::offer("peer", SessionDescription::offer("v=0"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "sdp-offer", "to": "peer", "sdp": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_relayed_answer_carries_from() {
        let raw = r#"{"type":"sdp-answer","to":"me","from":"them","sdp":{"type":"answer","sdp":"v=0"}}"#;
        match serde_json::from_str::<SignalMessage>(raw).unwrap() {
            SignalMessage::SdpAnswer { from, sdp, .. } => {
                assert_eq!(from.as_deref(), Some("them"));
                assert_eq!(sdp, SessionDescription::answer("v=0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_peers_and_keepalive() {
        let peers: SignalMessage = serde_json::from_str(r#"{"type":"peers","peers":["a","b"]}"#).unwrap();
        assert_eq!(
            peers,
            SignalMessage::Peers {
                peers: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(
            serde_json::to_string(&SignalMessage::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
        assert_eq!(
            serde_json::from_str::<SignalMessage>(r#"{"type":"pong"}"#).unwrap(),
            SignalMessage::Pong
        );
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"text","body":"hi"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Unknown);
    }
}
