//! Relay messages and the DKG envelope
//!
//! The relay treats payloads as opaque bytes. It only opens the envelope far
//! enough to learn who signed a message, so a message is never echoed back to
//! its author. The envelope is an SSV message whose `Data` carries a signed
//! DKG message; the signed message's own `Data` carries the protocol message.

use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Operator identifier as it appears inside signed messages
pub type OperatorId = u64;

/// SSV message type tag for DKG traffic
pub const DKG_MSG_TYPE: u64 = 3;

/// A payload bound for a topic
///
/// Each fan-out destination receives its own clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the payload was published to
    pub topic: String,
    /// Opaque payload as received from the publisher
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Hex SHA-256 of the payload, used as the retry key
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.payload))
    }
}

/// Outer SSV wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SsvMessage {
    pub msg_type: u64,
    #[serde(rename = "MsgID", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<Vec<u8>>,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// DKG message body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DkgMessage {
    pub msg_type: u64,
    /// Run request id
    pub identifier: Vec<u8>,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Operator-signed DKG message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedMessage {
    pub message: DkgMessage,
    pub signer: OperatorId,
    #[serde(with = "b64", default)]
    pub signature: Vec<u8>,
}

impl SignedMessage {
    /// Hex request id, which is also the run's topic name
    pub fn request_id(&self) -> String {
        hex::encode(&self.message.identifier)
    }

    /// Wrap in an SSV message and encode for publishing
    pub fn to_envelope(&self) -> Result<Vec<u8>> {
        let ssv = SsvMessage {
            msg_type: DKG_MSG_TYPE,
            msg_id: None,
            data: serde_json::to_vec(self)?,
        };
        Ok(serde_json::to_vec(&ssv)?)
    }
}

#[derive(Deserialize)]
struct RoundProbe {
    #[serde(rename = "Round")]
    round: Option<u64>,
}

/// What the dispatcher needs to route a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// Operator that signed the message
    pub sender: OperatorId,
    /// Protocol round, when the inner message exposes one
    pub round: Option<u64>,
    /// Hex request id
    pub request_id: String,
}

impl RouteInfo {
    /// Sender id in the form subscribers register under
    pub fn sender_name(&self) -> String {
        self.sender.to_string()
    }
}

/// Decode a published payload far enough to route it
///
/// Failing to read the SSV wrapper or the signed message is a decode error.
/// The protocol round is best-effort.
pub fn decode_route(payload: &[u8]) -> Result<RouteInfo> {
    let ssv: SsvMessage = serde_json::from_slice(payload)
        .map_err(|e| RelayError::Decode(format!("ssv message: {e}")))?;
    let signed: SignedMessage = serde_json::from_slice(&ssv.data)
        .map_err(|e| RelayError::Decode(format!("signed message: {e}")))?;

    let round = serde_json::from_slice::<RoundProbe>(&signed.message.data)
        .ok()
        .and_then(|probe| probe.round);

    Ok(RouteInfo {
        sender: signed.signer,
        round,
        request_id: signed.request_id(),
    })
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(signer: OperatorId, round: u64) -> SignedMessage {
        SignedMessage {
            message: DkgMessage {
                msg_type: 0,
                identifier: vec![0xab, 0xc1, 0x23],
                data: serde_json::to_vec(&serde_json::json!({ "Round": round })).unwrap(),
            },
            signer,
            signature: vec![7; 4],
        }
    }

    #[test]
    fn test_decode_route() {
        let payload = signed(2, 3).to_envelope().unwrap();
        let route = decode_route(&payload).unwrap();

        assert_eq!(route.sender, 2);
        assert_eq!(route.sender_name(), "2");
        assert_eq!(route.round, Some(3));
        assert_eq!(route.request_id, "abc123");
    }

    #[test]
    fn test_round_is_optional() {
        let mut msg = signed(4, 1);
        msg.message.data = b"not json".to_vec();

        let route = decode_route(&msg.to_envelope().unwrap()).unwrap();
        assert_eq!(route.sender, 4);
        assert_eq!(route.round, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_route(b"\x00\x01"), Err(RelayError::Decode(_))));

        let ssv = SsvMessage {
            msg_type: DKG_MSG_TYPE,
            msg_id: None,
            data: b"{\"Signer\": 1}".to_vec(),
        };
        let payload = serde_json::to_vec(&ssv).unwrap();
        assert!(matches!(decode_route(&payload), Err(RelayError::Decode(_))));
    }

    #[test]
    fn test_content_hash() {
        let a = Message::new("t", b"payload".to_vec());
        let b = Message::new("other", b"payload".to_vec());
        let c = Message::new("t", b"payload2".to_vec());

        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
