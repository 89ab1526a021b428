// mole tunnel protocol message types.
//
// Every message travels inside an `Envelope`: a numeric type tag, a request
// id and an opaque CBOR-encoded payload. Handlers decode the payload that
// matches the tag they are registered for.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{MoleError, MoleResult};

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    HelloOk = 0x02,

    TunnelOpen = 0x10,
    TunnelOpened = 0x11,
    TcpDial = 0x12,
    TcpDialResult = 0x13,
    ShellOpen = 0x14,
    ShellOpened = 0x15,

    TunnelData = 0x20,
    TunnelClose = 0x21,

    Error = 0x7f,
}

impl MsgType {
    /// Whether this type answers a request (routed by request id instead of
    /// through the handler table).
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::HelloOk
                | Self::TunnelOpened
                | Self::TcpDialResult
                | Self::ShellOpened
                | Self::Error
        )
    }

    /// The response type a request of this type expects, if any.
    pub fn response(self) -> Option<MsgType> {
        match self {
            Self::Hello => Some(Self::HelloOk),
            Self::TunnelOpen => Some(Self::TunnelOpened),
            Self::TcpDial => Some(Self::TcpDialResult),
            Self::ShellOpen => Some(Self::ShellOpened),
            _ => None,
        }
    }
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloOk),
            0x10 => Ok(Self::TunnelOpen),
            0x11 => Ok(Self::TunnelOpened),
            0x12 => Ok(Self::TcpDial),
            0x13 => Ok(Self::TcpDialResult),
            0x14 => Ok(Self::ShellOpen),
            0x15 => Ok(Self::ShellOpened),
            0x20 => Ok(Self::TunnelData),
            0x21 => Ok(Self::TunnelClose),
            0x7f => Ok(Self::Error),
            _ => Err(format!("unknown message type: 0x{v:02x}")),
        }
    }
}

/// Protocol version string exchanged in `Hello`.
pub const PROTOCOL_VERSION: &str = "mole-v1";

/// Error codes carried by [`ErrorPayload`].
pub mod error_code {
    pub const MALFORMED: u32 = 1;
    pub const UNKNOWN_TYPE: u32 = 2;
    pub const BAD_SESSION: u32 = 3;
    pub const SPAWN_FAILED: u32 = 4;
    pub const TUNNEL_IN_USE: u32 = 5;
}

/// Status returned for a `TcpDial` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStatus {
    Connected,
    Malformed,
    ResolveFailed,
    ConnectFailed,
    Unknown(u8),
}

impl DialStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Connected => 0x00,
            Self::Malformed => 0xF0,
            Self::ResolveFailed => 0xF1,
            Self::ConnectFailed => 0xF2,
            Self::Unknown(c) => c,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl From<u8> for DialStatus {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Connected,
            0xF0 => Self::Malformed,
            0xF1 => Self::ResolveFailed,
            0xF2 => Self::ConnectFailed,
            other => Self::Unknown(other),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────

/// Outer envelope: every message has a type, a request id and an opaque payload.
///
/// `id` is zero for unsolicited messages. A response carries the id of the
/// request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: u64,

    #[serde(rename = "type")]
    pub msg_type: MsgType,

    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Build an envelope by CBOR-encoding `payload`.
    pub fn new<T: Serialize>(msg_type: MsgType, id: u64, payload: &T) -> MoleResult<Self> {
        Ok(Self {
            id,
            msg_type,
            data: cbor_encode(payload)?,
        })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> MoleResult<T> {
        cbor_decode(&self.data).map_err(|e| {
            MoleError::InvalidMessage(format!("{:?} payload: {e}", self.msg_type))
        })
    }

    /// Build an `Error` response to this envelope.
    pub fn error_reply(&self, code: u32, message: impl Into<String>) -> MoleResult<Self> {
        Envelope::new(
            MsgType::Error,
            self.id,
            &ErrorPayload {
                code,
                message: message.into(),
            },
        )
    }
}

/// Envelope as read off the wire, before its type tag is checked.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub id: u64,

    #[serde(rename = "type")]
    pub msg_type: u8,

    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
}

// ── Message payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOkPayload {
    pub session_id: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOpenPayload {
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelOpenedPayload {
    pub tunnel_id: u64,
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpDialPayload {
    pub remote_host: String,
    pub remote_port: u16,
    pub tunnel_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpDialResultPayload {
    pub status_code: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOpenPayload {
    pub tunnel_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub pty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOpenedPayload {
    pub tunnel_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub path: String,
}

/// One sequenced chunk of tunnel payload, or a close signal when `closed` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDataPayload {
    pub tunnel_id: u64,
    pub sequence: u64,
    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelClosePayload {
    pub tunnel_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

// ── Helper for bytes serde ───────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_tags_round_trip_through_u8() {
        for t in [
            MsgType::Hello,
            MsgType::TunnelOpen,
            MsgType::TcpDial,
            MsgType::TunnelData,
            MsgType::TunnelClose,
            MsgType::Error,
        ] {
            assert_eq!(MsgType::try_from(u8::from(t)).unwrap(), t);
        }
        assert!(MsgType::try_from(0x99).is_err());
    }

    #[test]
    fn responses_map_to_requests() {
        assert_eq!(MsgType::TcpDial.response(), Some(MsgType::TcpDialResult));
        assert_eq!(MsgType::TunnelData.response(), None);
        assert!(MsgType::TcpDialResult.is_response());
        assert!(!MsgType::TunnelClose.is_response());
    }

    #[test]
    fn dial_status_codes() {
        assert_eq!(DialStatus::from(0x00), DialStatus::Connected);
        assert_eq!(DialStatus::from(0xF1), DialStatus::ResolveFailed);
        assert_eq!(DialStatus::ConnectFailed.code(), 0xF2);
        assert_eq!(DialStatus::from(0x42), DialStatus::Unknown(0x42));
        assert!(!DialStatus::Malformed.is_connected());
    }

    #[test]
    fn envelope_carries_opaque_payload() {
        let payload = TunnelDataPayload {
            tunnel_id: 9,
            sequence: 3,
            data: b"abc".to_vec(),
            closed: false,
        };
        let env = Envelope::new(MsgType::TunnelData, 0, &payload).unwrap();
        let bytes = cbor_encode(&env).unwrap();
        let back: Envelope = cbor_decode(&bytes).unwrap();
        assert_eq!(back.msg_type, MsgType::TunnelData);
        assert_eq!(back.decode::<TunnelDataPayload>().unwrap(), payload);
    }

    #[test]
    fn raw_envelope_keeps_unknown_tag() {
        let env = Envelope::new(MsgType::TunnelClose, 12, &TunnelClosePayload { tunnel_id: 1 }).unwrap();
        let raw: RawEnvelope = cbor_decode(&cbor_encode(&env).unwrap()).unwrap();
        assert_eq!(raw.id, 12);
        assert_eq!(raw.msg_type, 0x21);
        assert_eq!(raw.data, env.data);
    }

    #[test]
    fn decode_wrong_payload_is_invalid_message() {
        let env = Envelope::new(MsgType::TcpDial, 1, &HelloPayload { version: "x".into() }).unwrap();
        match env.decode::<TcpDialPayload>() {
            Err(MoleError::InvalidMessage(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
