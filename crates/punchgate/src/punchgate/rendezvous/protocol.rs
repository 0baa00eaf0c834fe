use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::punchgate::{ids::PeerId, net};

/// Bare keepalive payloads; everything else on the hangout socket is JSON.
pub const PING: &[u8] = b"pi";
pub const PONG: &[u8] = b"po";

#[derive(Debug, Error)]
pub enum HangoutMessageError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Datagrams this node sends to a hangout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HangoutRequest {
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Sent from the client-role node so the hangout learns its external address.
    PunchClient {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "identPeer", default, skip_serializing_if = "Option::is_none")]
        ident_peer: Option<PeerId>,
    },
    /// Sent from the server-role node so the hangout learns its external address.
    PunchServer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "identPeer", default, skip_serializing_if = "Option::is_none")]
        ident_peer: Option<PeerId>,
    },
}

/// Datagrams a hangout sends to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HangoutMessage {
    Identity {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Status {
        #[serde(default)]
        online: HashMap<PeerId, serde_json::Value>,
    },
    /// A remote client-role node asks our server role to punch toward it.
    PunchClient(PunchRelay),
    /// A remote server-role node asks our client role to punch toward it.
    PunchServer(PunchRelay),
    #[serde(other)]
    Unknown,
}

/// The remote node's externally observed address, relayed by a hangout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchRelay {
    #[serde(rename = "identPeer")]
    pub ident_peer: PeerId,
    pub address: String,
    pub port: u16,
}

impl PunchRelay {
    pub fn remote_addr(&self) -> String {
        net::join_host_port(&self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Message(HangoutMessage),
}

pub fn decode(buf: &[u8]) -> Result<Inbound, HangoutMessageError> {
    if buf == PING {
        return Ok(Inbound::Ping);
    }
    Ok(Inbound::Message(serde_json::from_slice(buf)?))
}

pub fn encode(req: &HangoutRequest) -> Result<Vec<u8>, HangoutMessageError> {
    Ok(serde_json::to_vec(req)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ping_is_not_json() {
        assert_eq!(decode(b"pi").unwrap(), Inbound::Ping);
        assert!(decode(b"po").is_err());
    }

    #[test]
    fn requests_use_wire_field_names() {
        let b = encode(&HangoutRequest::Register {
            peer_id: PeerId::from("bob"),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v, json!({"type": "REGISTER", "peerId": "bob"}));

        let b = encode(&HangoutRequest::PunchServer {
            peer_id: PeerId::from("bob"),
            ident_peer: None,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v, json!({"type": "PUNCH_SERVER", "peerId": "bob"}));

        let b = encode(&HangoutRequest::PunchClient {
            peer_id: PeerId::from("bob"),
            ident_peer: Some(PeerId::from("alice")),
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(
            v,
            json!({"type": "PUNCH_CLIENT", "peerId": "bob", "identPeer": "alice"})
        );
    }

    #[test]
    fn decodes_every_hangout_message() {
        let m = decode(br#"{"type":"IDENTITY","peerId":"me"}"#).unwrap();
        assert_eq!(
            m,
            Inbound::Message(HangoutMessage::Identity {
                peer_id: PeerId::from("me")
            })
        );

        let m = decode(br#"{"type":"STATUS","online":{"a":{},"b":{"x":1}}}"#).unwrap();
        let Inbound::Message(HangoutMessage::Status { online }) = m else {
            panic!("expected status");
        };
        assert_eq!(online.len(), 2);
        assert!(online.contains_key("b"));

        let m = decode(
            br#"{"type":"PUNCH_CLIENT","identPeer":"a","address":"203.0.113.9","port":4100}"#,
        )
        .unwrap();
        let Inbound::Message(HangoutMessage::PunchClient(relay)) = m else {
            panic!("expected punch client");
        };
        assert_eq!(relay.ident_peer, PeerId::from("a"));
        assert_eq!(relay.remote_addr(), "203.0.113.9:4100");
    }

    #[test]
    fn unknown_type_and_malformed_json() {
        let m = decode(br#"{"type":"GOSSIP","payload":[1,2]}"#).unwrap();
        assert_eq!(m, Inbound::Message(HangoutMessage::Unknown));

        assert!(decode(b"{not json").is_err());
        assert!(decode(br#"{"peerId":"untagged"}"#).is_err());
        // A relay without the remote's address is malformed, not unknown.
        assert!(decode(br#"{"type":"PUNCH_SERVER","identPeer":"a"}"#).is_err());
    }
}
