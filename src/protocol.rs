//! JSON hub protocol codec.
//!
//! Every message is a UTF-8 JSON object terminated by the ASCII record
//! separator (`0x1E`):
//!
//! ```text
//! {"protocol":"json","version":1}<RS>                       handshake request
//! {}<RS>                                                    handshake response
//! {"type":1,"target":"Ping","arguments":["hi"],"invocationId":"1"}<RS>
//! {"type":3,"invocationId":"1","result":"hi"}<RS>           completion (result)
//! {"type":3,"invocationId":"1","error":"boom"}<RS>          completion (error)
//! {"type":6}<RS>                                            ping
//! {"type":7,"error":"idle timeout"}<RS>                     close
//! ```
//!
//! Unknown fields are ignored so newer peers can add fields freely.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, Result};

/// Terminates every record on the wire.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Default cap on a single inbound record, separator excluded.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Default cap on the number of arguments in one invocation.
pub const DEFAULT_MAX_ARGUMENTS: usize = 64;

/// The only protocol name accepted in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// The only protocol version accepted in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Numeric message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Invocation = 1,
    Completion = 3,
    Ping = 6,
    Close = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = HubError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MessageKind::Invocation),
            3 => Ok(MessageKind::Completion),
            6 => Ok(MessageKind::Ping),
            7 => Ok(MessageKind::Close),
            // 2, 4 and 5 are the streaming messages, which this hub does not speak.
            other => Err(HubError::UnknownMessageType(other)),
        }
    }
}

/// A single remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Method name on the receiving side.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Correlation id. Present when the caller expects a completion.
    pub invocation_id: Option<String>,
}

impl Invocation {
    /// A fire-and-forget invocation (no completion expected).
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
            invocation_id: None,
        }
    }

    /// An invocation that asks for a completion.
    pub fn with_id(
        target: impl Into<String>,
        arguments: Vec<Value>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            arguments,
            invocation_id: Some(invocation_id.into()),
        }
    }
}

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    /// Successful completion. `Value::Null` for methods with no result.
    Result { invocation_id: String, result: Value },
    /// Failed completion.
    Error { invocation_id: String, error: String },
    Ping,
    Close { error: Option<String> },
}

impl HubMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            HubMessage::Invocation(_) => MessageKind::Invocation,
            HubMessage::Result { .. } | HubMessage::Error { .. } => MessageKind::Completion,
            HubMessage::Ping => MessageKind::Ping,
            HubMessage::Close { .. } => MessageKind::Close,
        }
    }

    /// The correlation id carried by this message, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            HubMessage::Invocation(inv) => inv.invocation_id.as_deref(),
            HubMessage::Result { invocation_id, .. } | HubMessage::Error { invocation_id, .. } => {
                Some(invocation_id)
            }
            HubMessage::Ping | HubMessage::Close { .. } => None,
        }
    }
}

/// Flat wire shape shared by every message type.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&HubMessage> for WireMessage {
    fn from(msg: &HubMessage) -> Self {
        let kind = msg.kind() as u8;
        match msg {
            HubMessage::Invocation(inv) => WireMessage {
                kind,
                invocation_id: inv.invocation_id.clone(),
                target: Some(inv.target.clone()),
                arguments: Some(inv.arguments.clone()),
                ..Default::default()
            },
            HubMessage::Result {
                invocation_id,
                result,
            } => WireMessage {
                kind,
                invocation_id: Some(invocation_id.clone()),
                // Void completions carry no result field.
                result: (!result.is_null()).then(|| result.clone()),
                ..Default::default()
            },
            HubMessage::Error {
                invocation_id,
                error,
            } => WireMessage {
                kind,
                invocation_id: Some(invocation_id.clone()),
                error: Some(error.clone()),
                ..Default::default()
            },
            HubMessage::Ping => WireMessage {
                kind,
                ..Default::default()
            },
            HubMessage::Close { error } => WireMessage {
                kind,
                error: error.clone(),
                ..Default::default()
            },
        }
    }
}

/// Handshake sent by the client as its first record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    /// Check that the client asked for a protocol this hub speaks.
    pub fn validate(&self) -> Result<()> {
        if self.protocol != PROTOCOL_NAME {
            return Err(HubError::Handshake(format!(
                "the protocol '{}' is not supported",
                self.protocol
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(HubError::Handshake(format!(
                "the protocol '{}' version {} is not supported",
                self.protocol, self.version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Encoder/decoder for hub messages with inbound size limits.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_message_size: usize,
    max_arguments: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_ARGUMENTS)
    }
}

impl Codec {
    pub fn new(max_message_size: usize, max_arguments: usize) -> Self {
        Self {
            max_message_size,
            max_arguments,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a message as one record, separator included.
    pub fn encode(&self, msg: &HubMessage) -> Result<Bytes> {
        encode_record(&WireMessage::from(msg))
    }

    /// Decode one record. A trailing separator is tolerated.
    ///
    /// The size limit is checked before any parsing, so the argument limit
    /// only ever applies to a buffer that is already bounded.
    pub fn decode(&self, frame: &[u8]) -> Result<HubMessage> {
        let frame = self.check_size(frame)?;
        let wire: WireMessage = serde_json::from_slice(frame)?;

        match MessageKind::try_from(wire.kind)? {
            MessageKind::Invocation => {
                let target = wire
                    .target
                    .ok_or_else(|| HubError::ParseError("invocation without target".into()))?;
                let arguments = wire.arguments.unwrap_or_default();
                if arguments.len() > self.max_arguments {
                    return Err(HubError::TooManyArguments {
                        count: arguments.len(),
                        limit: self.max_arguments,
                    });
                }
                Ok(HubMessage::Invocation(Invocation {
                    target,
                    arguments,
                    invocation_id: wire.invocation_id,
                }))
            }
            MessageKind::Completion => {
                let invocation_id = wire.invocation_id.ok_or_else(|| {
                    HubError::ParseError("completion without invocationId".into())
                })?;
                match wire.error {
                    Some(error) => Ok(HubMessage::Error {
                        invocation_id,
                        error,
                    }),
                    None => Ok(HubMessage::Result {
                        invocation_id,
                        result: wire.result.unwrap_or(Value::Null),
                    }),
                }
            }
            MessageKind::Ping => Ok(HubMessage::Ping),
            MessageKind::Close => Ok(HubMessage::Close { error: wire.error }),
        }
    }

    /// Pull just the invocation id out of a record that failed to decode.
    ///
    /// Lets the hub answer a rejected invocation with an error completion.
    /// Oversized or unparseable records yield `None`.
    pub fn peek_invocation_id(&self, frame: &[u8]) -> Option<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct IdOnly {
            #[serde(default)]
            invocation_id: Option<String>,
        }

        let frame = self.check_size(frame).ok()?;
        serde_json::from_slice::<IdOnly>(frame).ok()?.invocation_id
    }

    /// Decode the client's handshake record.
    pub fn decode_handshake(&self, frame: &[u8]) -> Result<HandshakeRequest> {
        let frame = self.check_size(frame)?;
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode the handshake response: `{}` on success, `{"error":..}` otherwise.
    pub fn encode_handshake_response(&self, error: Option<&str>) -> Result<Bytes> {
        encode_record(&HandshakeResponse {
            error: error.map(str::to_owned),
        })
    }

    /// Strip a trailing separator and enforce the size limit.
    fn check_size<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        let frame = frame.strip_suffix(&[RECORD_SEPARATOR]).unwrap_or(frame);
        if frame.len() > self.max_message_size {
            return Err(HubError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        Ok(frame)
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(128).writer();
    serde_json::to_writer(&mut writer, value)?;
    let mut buf = writer.into_inner();
    buf.put_u8(RECORD_SEPARATOR);
    Ok(buf.freeze())
}

/// Splits a byte stream into records on the separator.
///
/// Never buffers more than `max_message_size` bytes of an unterminated
/// record: once that is exceeded the partial record is thrown away and
/// everything up to the next separator is skipped.
#[derive(Debug)]
pub struct RecordFramer {
    max_message_size: usize,
    discarding: bool,
}

impl RecordFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            discarding: false,
        }
    }

    /// Take the next complete record out of `buf`, separator stripped.
    ///
    /// Returns `Ok(None)` when more data is needed. Oversized records are
    /// reported once as [`HubError::MessageTooLarge`]; the caller may keep
    /// reading afterwards.
    pub fn next_record(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            let separator = buf.iter().position(|&b| b == RECORD_SEPARATOR);

            if self.discarding {
                match separator {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            match separator {
                Some(0) => {
                    // Empty record, nothing to hand out.
                    buf.advance(1);
                }
                Some(pos) => {
                    let record = buf.split_to(pos).freeze();
                    buf.advance(1);
                    if record.len() > self.max_message_size {
                        return Err(HubError::MessageTooLarge {
                            size: record.len(),
                            limit: self.max_message_size,
                        });
                    }
                    return Ok(Some(record));
                }
                None if buf.len() > self.max_message_size => {
                    let size = buf.len();
                    buf.clear();
                    self.discarding = true;
                    return Err(HubError::MessageTooLarge {
                        size,
                        limit: self.max_message_size,
                    });
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strip(bytes: &Bytes) -> &str {
        let s = std::str::from_utf8(bytes).unwrap();
        s.strip_suffix('\u{1e}').unwrap()
    }

    #[test]
    fn test_decode_invocation() {
        let codec = Codec::default();
        let msg = codec
            .decode(br#"{"type":1,"target":"Ping","arguments":["hello"],"invocationId":"1"}"#)
            .unwrap();
        assert_eq!(
            msg,
            HubMessage::Invocation(Invocation::with_id("Ping", vec![json!("hello")], "1"))
        );
    }

    #[test]
    fn test_roundtrip_preserves_messages() {
        let codec = Codec::default();
        let messages = [
            HubMessage::Invocation(Invocation::new("Notify", vec![json!({"a": [1, 2]}), json!(null)])),
            HubMessage::Invocation(Invocation::with_id("Add", vec![json!(1), json!(2.5)], "7")),
            HubMessage::Result {
                invocation_id: "7".into(),
                result: json!(3.5),
            },
            HubMessage::Result {
                invocation_id: "8".into(),
                result: Value::Null,
            },
            HubMessage::Error {
                invocation_id: "9".into(),
                error: "boom".into(),
            },
            HubMessage::Ping,
            HubMessage::Close { error: None },
            HubMessage::Close {
                error: Some("server shutting down".into()),
            },
        ];

        for msg in messages {
            let encoded = codec.encode(&msg).unwrap();
            assert_eq!(encoded.last(), Some(&RECORD_SEPARATOR));
            assert_eq!(codec.decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_encode_wire_shape() {
        let codec = Codec::default();
        let encoded = codec
            .encode(&HubMessage::Result {
                invocation_id: "1".into(),
                result: Value::Null,
            })
            .unwrap();
        assert_eq!(strip(&encoded), r#"{"type":3,"invocationId":"1"}"#);

        let encoded = codec.encode(&HubMessage::Ping).unwrap();
        assert_eq!(strip(&encoded), r#"{"type":6}"#);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let codec = Codec::default();
        let msg = codec
            .decode(br#"{"type":1,"target":"Echo","arguments":[],"headers":{"x":"y"},"streamIds":[]}"#)
            .unwrap();
        assert_eq!(msg, HubMessage::Invocation(Invocation::new("Echo", vec![])));
    }

    #[test]
    fn test_missing_arguments_is_empty() {
        let codec = Codec::default();
        let msg = codec.decode(br#"{"type":1,"target":"Whoami"}"#).unwrap();
        assert_eq!(msg, HubMessage::Invocation(Invocation::new("Whoami", vec![])));
    }

    #[test]
    fn test_message_too_large() {
        let codec = Codec::new(16, 4);
        let err = codec
            .decode(br#"{"type":1,"target":"SomethingLong"}"#)
            .unwrap_err();
        assert!(matches!(err, HubError::MessageTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_too_many_arguments() {
        let codec = Codec::new(1024, 2);
        let err = codec
            .decode(br#"{"type":1,"target":"Echo","arguments":[1,2,3]}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            HubError::TooManyArguments { count: 3, limit: 2 }
        ));

        // The id is still recoverable so the caller can be told.
        assert_eq!(
            codec.peek_invocation_id(br#"{"type":1,"target":"Echo","arguments":[1,2,3],"invocationId":"9"}"#),
            Some("9".to_string())
        );
        assert_eq!(codec.peek_invocation_id(b"not json"), None);
        assert_eq!(codec.peek_invocation_id(br#"{"type":1}"#), None);
    }

    #[test]
    fn test_parse_errors() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode(b"not json"),
            Err(HubError::ParseError(_))
        ));
        assert!(matches!(
            codec.decode(br#"{"type":1,"arguments":[]}"#),
            Err(HubError::ParseError(_))
        ));
        assert!(matches!(
            codec.decode(br#"{"type":3,"result":1}"#),
            Err(HubError::ParseError(_))
        ));
        assert!(matches!(
            codec.decode(br#"{"target":"Echo"}"#),
            Err(HubError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode(br#"{"type":4,"target":"Stream"}"#),
            Err(HubError::UnknownMessageType(4))
        ));
    }

    #[test]
    fn test_handshake() {
        let codec = Codec::default();
        let request = codec
            .decode_handshake(b"{\"protocol\":\"json\",\"version\":1}\x1e")
            .unwrap();
        assert!(request.validate().is_ok());

        let request = codec
            .decode_handshake(br#"{"protocol":"messagepack","version":1}"#)
            .unwrap();
        assert!(matches!(request.validate(), Err(HubError::Handshake(_))));

        let request = codec
            .decode_handshake(br#"{"protocol":"json","version":2}"#)
            .unwrap();
        assert!(matches!(request.validate(), Err(HubError::Handshake(_))));

        let ok = codec.encode_handshake_response(None).unwrap();
        assert_eq!(strip(&ok), "{}");
        let err = codec.encode_handshake_response(Some("nope")).unwrap();
        assert_eq!(strip(&err), r#"{"error":"nope"}"#);
    }

    #[test]
    fn test_framer_splits_records() {
        let mut framer = RecordFramer::new(64);
        let mut buf = BytesMut::from(&b"{\"type\":6}\x1e\x1e{\"type\":7}\x1e{\"ty"[..]);

        assert_eq!(framer.next_record(&mut buf).unwrap().unwrap(), &b"{\"type\":6}"[..]);
        assert_eq!(framer.next_record(&mut buf).unwrap().unwrap(), &b"{\"type\":7}"[..]);
        assert!(framer.next_record(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"ty");

        buf.extend_from_slice(b"pe\":6}\x1e");
        assert_eq!(framer.next_record(&mut buf).unwrap().unwrap(), &b"{\"type\":6}"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framer_discards_oversized_record() {
        let mut framer = RecordFramer::new(8);
        let mut buf = BytesMut::from(&b"0123456789abc"[..]);

        assert!(matches!(
            framer.next_record(&mut buf),
            Err(HubError::MessageTooLarge { size: 13, limit: 8 })
        ));
        assert!(buf.is_empty());

        // The tail of the oversized record is skipped, the next one survives.
        buf.extend_from_slice(b"defgh\x1e{\"a\":1}\x1e");
        assert_eq!(framer.next_record(&mut buf).unwrap().unwrap(), &b"{\"a\":1}"[..]);
    }

    #[test]
    fn test_framer_rejects_complete_oversized_record() {
        let mut framer = RecordFramer::new(4);
        let mut buf = BytesMut::from(&b"123456\x1e{}\x1e"[..]);
        assert!(matches!(
            framer.next_record(&mut buf),
            Err(HubError::MessageTooLarge { size: 6, .. })
        ));
        assert_eq!(framer.next_record(&mut buf).unwrap().unwrap(), &b"{}"[..]);
    }
}
