//! Typed frames carried by the codec.

use super::codec::{
    decode_payload, encode_payload, MSG_CALL, MSG_ERROR, MSG_EVENT, MSG_HELLO, MSG_PEER_JOINED,
    MSG_PEER_LEFT, MSG_PING, MSG_REJECT, MSG_REPLY, MSG_WELCOME,
};
use super::{Call, CallResult};
use crate::events::Event;
use crate::types::{Error, Identity, Result};
use serde::{Deserialize, Serialize};

/// Protocol revision sent in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub identity: Identity,
    pub protocol: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub peers: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    /// Routing key: the module that issued the call.
    pub caller: Identity,
    pub responder: Identity,
    pub result: CallResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reject {
    pub id: u64,
    pub target: Identity,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub message: String,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Hello),
    Welcome(Welcome),
    Call(Call),
    Reply(Reply),
    Reject(Reject),
    Event(Event),
    PeerJoined(Presence),
    PeerLeft(Presence),
    Ping,
    Error(ProtocolError),
}

impl Frame {
    pub fn msg_type(&self) -> u8 {
        match self {
            Frame::Hello(_) => MSG_HELLO,
            Frame::Welcome(_) => MSG_WELCOME,
            Frame::Call(_) => MSG_CALL,
            Frame::Reply(_) => MSG_REPLY,
            Frame::Reject(_) => MSG_REJECT,
            Frame::Event(_) => MSG_EVENT,
            Frame::PeerJoined(_) => MSG_PEER_JOINED,
            Frame::PeerLeft(_) => MSG_PEER_LEFT,
            Frame::Ping => MSG_PING,
            Frame::Error(_) => MSG_ERROR,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(ProtocolError {
            message: message.into(),
        })
    }

    /// Encode to `(msg_type, payload)`.
    pub fn encode(&self) -> Result<(u8, Vec<u8>)> {
        let payload = match self {
            Frame::Hello(inner) => encode_payload(inner)?,
            Frame::Welcome(inner) => encode_payload(inner)?,
            Frame::Call(inner) => encode_payload(inner)?,
            Frame::Reply(inner) => encode_payload(inner)?,
            Frame::Reject(inner) => encode_payload(inner)?,
            Frame::Event(inner) => encode_payload(inner)?,
            Frame::PeerJoined(inner) | Frame::PeerLeft(inner) => encode_payload(inner)?,
            Frame::Ping => Vec::new(),
            Frame::Error(inner) => encode_payload(inner)?,
        };
        Ok((self.msg_type(), payload))
    }

    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self> {
        Ok(match msg_type {
            MSG_HELLO => Frame::Hello(decode_payload(payload)?),
            MSG_WELCOME => Frame::Welcome(decode_payload(payload)?),
            MSG_CALL => Frame::Call(decode_payload(payload)?),
            MSG_REPLY => Frame::Reply(decode_payload(payload)?),
            MSG_REJECT => Frame::Reject(decode_payload(payload)?),
            MSG_EVENT => Frame::Event(decode_payload(payload)?),
            MSG_PEER_JOINED => Frame::PeerJoined(decode_payload(payload)?),
            MSG_PEER_LEFT => Frame::PeerLeft(decode_payload(payload)?),
            MSG_PING => Frame::Ping,
            MSG_ERROR => Frame::Error(decode_payload(payload)?),
            other => {
                return Err(Error::validation(format!(
                    "Unexpected message type: 0x{:02X}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn id(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn round_trip(frame: Frame) -> Frame {
        let (msg_type, payload) = frame.encode().unwrap();
        Frame::decode(msg_type, &payload).unwrap()
    }

    #[test]
    fn test_call_with_nested_args() {
        let frame = Frame::Call(Call {
            id: 7,
            caller: id("scheduler"),
            target: id("telescope"),
            method: "move_radec".into(),
            args: vec![json!(10.5), json!({"epoch": "J2000", "offsets": [1, -2]})],
            deadline_ms: 1_200_000,
        });
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_reply_failure_survives() {
        let frame = Frame::Reply(Reply {
            id: 3,
            caller: id("scheduler"),
            responder: id("camera"),
            result: CallResult::Failure {
                kind: ErrorKind::Image,
                message: "readout".into(),
            },
        });
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_event_frame() {
        let event = Event::new(id("weather"), "BadWeatherEvent", json!({}));
        let frame = Frame::Event(event);
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_ping_has_empty_payload() {
        let (msg_type, payload) = Frame::Ping.encode().unwrap();
        assert_eq!(msg_type, MSG_PING);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(0x99, &[]).unwrap_err();
        assert!(err.to_string().contains("0x99"));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(Frame::decode(MSG_CALL, &[0xc1, 0x00]).is_err());
    }
}
