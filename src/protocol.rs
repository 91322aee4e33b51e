//! NSQ V2 wire protocol: command encoding, frame decoding and the JSON bodies
//! exchanged during the handshake.

use crate::config::{Compression, ConnectionConfig};
use crate::error::{NsqError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const OK: &[u8] = b"OK";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

// timestamp (8) + attempts (2) + id (16)
const MESSAGE_HEADER_SIZE: usize = 26;
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
const MAX_NAME_LENGTH: usize = 64;

/// The 16 byte identifier nsqd assigns to every message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for MessageId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Nanoseconds since the Unix epoch, as stamped by nsqd.
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_ref() == HEARTBEAT)
    }
}

/// Decodes one frame from the front of `buf`, leaving partial frames in place.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size < 4 {
        return Err(NsqError::Protocol(format!("frame size {size} too small")));
    }
    if size > MAX_FRAME_SIZE {
        return Err(NsqError::Protocol(format!("frame size {size} too large")));
    }
    if buf.len() < 4 + size {
        return Ok(None);
    }
    buf.advance(4);
    let mut data = buf.split_to(size).freeze();
    let frame_type = data.get_i32();

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
        FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
        FRAME_TYPE_MESSAGE => decode_message(data).map(|m| Some(Frame::Message(m))),
        other => Err(NsqError::Protocol(format!("unknown frame type {other}"))),
    }
}

fn decode_message(mut data: Bytes) -> Result<RawMessage> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Err(NsqError::Protocol(format!(
            "message frame of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let mut id = [0u8; 16];
    data.copy_to_slice(&mut id);
    Ok(RawMessage {
        timestamp,
        attempts,
        id: MessageId(id),
        body: data,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Identify(Bytes),
    Auth(String),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay: Duration },
    Touch(MessageId),
    Nop,
    Cls,
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, delay: Duration, body: Bytes },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Dpub { .. } => "DPUB",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Identify(body) => {
                buf.put_slice(b"IDENTIFY\n");
                put_sized(buf, body);
            }
            Command::Auth(secret) => {
                buf.put_slice(b"AUTH\n");
                put_sized(buf, secret.as_bytes());
            }
            Command::Sub { topic, channel } => {
                put_line(buf, &format!("SUB {topic} {channel}"));
            }
            Command::Rdy(count) => put_line(buf, &format!("RDY {count}")),
            Command::Fin(id) => put_id_line(buf, "FIN", id, None),
            Command::Req { id, delay } => {
                put_id_line(buf, "REQ", id, Some(delay.as_millis()));
            }
            Command::Touch(id) => put_id_line(buf, "TOUCH", id, None),
            Command::Nop => buf.put_slice(b"NOP\n"),
            Command::Cls => buf.put_slice(b"CLS\n"),
            Command::Pub { topic, body } => {
                put_line(buf, &format!("PUB {topic}"));
                put_sized(buf, body);
            }
            Command::Mpub { topic, bodies } => {
                put_line(buf, &format!("MPUB {topic}"));
                let size: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                buf.put_u32(size as u32);
                buf.put_u32(bodies.len() as u32);
                for body in bodies {
                    put_sized(buf, body);
                }
            }
            Command::Dpub { topic, delay, body } => {
                put_line(buf, &format!("DPUB {topic} {}", delay.as_millis()));
                put_sized(buf, body);
            }
        }
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

fn put_id_line(buf: &mut BytesMut, name: &str, id: &MessageId, arg: Option<u128>) {
    buf.put_slice(name.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(id.as_bytes());
    if let Some(arg) = arg {
        buf.put_slice(format!(" {arg}").as_bytes());
    }
    buf.put_u8(b'\n');
}

fn put_sized(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

/// Body of the IDENTIFY command.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub user_agent: String,
    pub feature_negotiation: bool,
    /// Milliseconds.
    pub heartbeat_interval: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deflate_level: Option<u32>,
    pub snappy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u8>,
}

impl IdentifyRequest {
    pub fn new(
        config: &ConnectionConfig,
        message_timeout: Option<Duration>,
        sample_rate: u8,
    ) -> Self {
        let (deflate, deflate_level, snappy) = match config.compression {
            Compression::None => (false, None, false),
            Compression::Deflate { level } => (true, Some(level), false),
            Compression::Snappy => (false, None, true),
        };
        Self {
            client_id: config.client_id.clone(),
            hostname: config.hostname.clone(),
            user_agent: config.user_agent.clone(),
            feature_negotiation: true,
            heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
            tls_v1: config.tls,
            deflate,
            deflate_level,
            snappy,
            output_buffer_size: config.output_buffer_size,
            output_buffer_timeout: config.output_buffer_timeout,
            msg_timeout: message_timeout.map(|timeout| timeout.as_millis() as u64),
            sample_rate: (sample_rate > 0).then_some(sample_rate),
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        Ok(Command::Identify(Bytes::from(serde_json::to_vec(self)?)))
    }
}

/// Features nsqd agreed to in its IDENTIFY response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: u64,
    pub version: String,
    /// Milliseconds.
    pub max_msg_timeout: u64,
    /// Milliseconds.
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u8,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    // Values assumed for daemons that answer IDENTIFY with a bare OK.
    fn default() -> Self {
        Self {
            max_rdy_count: 2500,
            version: String::new(),
            max_msg_timeout: 15 * 60 * 1000,
            msg_timeout: 60 * 1000,
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

impl IdentifyResponse {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body == OK {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(Into::into)
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout)
    }

    pub fn max_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.max_msg_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthResponse {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub identity_url: Option<String>,
    #[serde(default)]
    pub permission_count: u64,
}

pub fn validate_topic_name(topic: &str) -> Result<()> {
    validate_name("topic", topic)
}

pub fn validate_channel_name(channel: &str) -> Result<()> {
    validate_name("channel", channel)
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(NsqError::Validation(format!("invalid {kind} name {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(frame_type: i32, data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32((data.len() + 4) as u32);
        buf.put_i32(frame_type);
        buf.put_slice(data);
        buf
    }

    fn message_payload(attempts: u16, id: &[u8; 16], body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        data.extend_from_slice(&attempts.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_decode_response_frame() {
        let mut buf = frame_bytes(FRAME_TYPE_RESPONSE, b"OK");
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Response(Bytes::from_static(b"OK")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_heartbeat() {
        let mut buf = frame_bytes(FRAME_TYPE_RESPONSE, HEARTBEAT);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert!(frame.is_heartbeat());
    }

    #[test]
    fn test_decode_message_frame() {
        let payload = message_payload(3, b"0123456789abcdef", b"hello");
        let mut buf = frame_bytes(FRAME_TYPE_MESSAGE, &payload);

        match decode_frame(&mut buf).unwrap() {
            Some(Frame::Message(message)) => {
                assert_eq!(message.attempts, 3);
                assert_eq!(message.id.to_string(), "0123456789abcdef");
                assert_eq!(message.body.as_ref(), b"hello");
                assert_eq!(message.timestamp, 1_700_000_000_000_000_000);
            }
            other => panic!("Expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let full = frame_bytes(FRAME_TYPE_ERROR, b"E_INVALID bad");
        let mut buf = BytesMut::from(&full[..6]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&full[6..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Error(Bytes::from_static(b"E_INVALID bad")));
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut buf = frame_bytes(FRAME_TYPE_RESPONSE, b"OK");
        buf.extend_from_slice(&frame_bytes(FRAME_TYPE_RESPONSE, HEARTBEAT));
        assert!(!decode_frame(&mut buf).unwrap().unwrap().is_heartbeat());
        assert!(decode_frame(&mut buf).unwrap().unwrap().is_heartbeat());
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        let mut buf = frame_bytes(7, b"x");
        assert!(matches!(decode_frame(&mut buf), Err(NsqError::Protocol(_))));

        let mut buf = frame_bytes(FRAME_TYPE_MESSAGE, b"short");
        assert!(matches!(decode_frame(&mut buf), Err(NsqError::Protocol(_))));

        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0, 0][..]);
        assert!(matches!(decode_frame(&mut buf), Err(NsqError::Protocol(_))));
    }

    #[test]
    fn test_encode_line_commands() {
        let id = MessageId::from(*b"0123456789abcdef");
        let cases = vec![
            (Command::Rdy(5), "RDY 5\n".to_string()),
            (Command::Fin(id), "FIN 0123456789abcdef\n".to_string()),
            (
                Command::Req {
                    id,
                    delay: Duration::from_secs(5),
                },
                "REQ 0123456789abcdef 5000\n".to_string(),
            ),
            (Command::Touch(id), "TOUCH 0123456789abcdef\n".to_string()),
            (Command::Nop, "NOP\n".to_string()),
            (Command::Cls, "CLS\n".to_string()),
            (
                Command::Sub {
                    topic: "events".to_string(),
                    channel: "archive".to_string(),
                },
                "SUB events archive\n".to_string(),
            ),
        ];

        for (command, expected) in cases {
            let mut buf = BytesMut::new();
            command.encode(&mut buf);
            assert_eq!(String::from_utf8(buf.to_vec()).unwrap(), expected);
        }
    }

    #[test]
    fn test_encode_pub() {
        let mut buf = BytesMut::new();
        Command::Pub {
            topic: "events".to_string(),
            body: Bytes::from_static(b"payload"),
        }
        .encode(&mut buf);

        assert_eq!(&buf[..11], b"PUB events\n");
        assert_eq!(&buf[11..15], &7u32.to_be_bytes());
        assert_eq!(&buf[15..], b"payload");
    }

    #[test]
    fn test_encode_mpub() {
        let mut buf = BytesMut::new();
        Command::Mpub {
            topic: "t".to_string(),
            bodies: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
        }
        .encode(&mut buf);

        let mut expected = b"MPUB t\n".to_vec();
        expected.extend_from_slice(&17u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(b"cde");
        assert_eq!(buf.to_vec(), expected);
    }

    #[test]
    fn test_identify_request_from_config() {
        let config = ConnectionConfig {
            compression: Compression::Deflate { level: 4 },
            client_id: Some("worker".to_string()),
            ..ConnectionConfig::default()
        };
        let identify = IdentifyRequest::new(&config, Some(Duration::from_secs(30)), 0);
        let json: serde_json::Value = serde_json::to_value(&identify).unwrap();

        assert_eq!(json["feature_negotiation"], true);
        assert_eq!(json["heartbeat_interval"], 30_000);
        assert_eq!(json["deflate"], true);
        assert_eq!(json["deflate_level"], 4);
        assert_eq!(json["snappy"], false);
        assert_eq!(json["msg_timeout"], 30_000);
        assert_eq!(json["client_id"], "worker");
        assert!(json.get("sample_rate").is_none());
        assert!(json.get("output_buffer_timeout").is_none());
    }

    #[test]
    fn test_identify_request_disables_output_buffering() {
        let config = ConnectionConfig {
            output_buffer_size: Some(-1),
            output_buffer_timeout: Some(-1),
            ..ConnectionConfig::default()
        };
        let identify = IdentifyRequest::new(&config, None, 0);
        let json: serde_json::Value = serde_json::to_value(&identify).unwrap();

        assert_eq!(json["output_buffer_size"], -1);
        assert_eq!(json["output_buffer_timeout"], -1);
    }

    #[test]
    fn test_identify_response_parsing() {
        let body = br#"{"max_rdy_count":500,"version":"1.3.0","max_msg_timeout":900000,"msg_timeout":60000,"tls_v1":false,"deflate":false,"deflate_level":0,"max_deflate_level":6,"snappy":true,"sample_rate":0,"auth_required":false,"output_buffer_size":16384,"output_buffer_timeout":250}"#;
        let response = IdentifyResponse::parse(body).unwrap();
        assert_eq!(response.max_rdy_count, 500);
        assert!(response.snappy);
        assert_eq!(response.msg_timeout(), Duration::from_secs(60));
        assert_eq!(response.max_msg_timeout(), Duration::from_secs(900));

        let legacy = IdentifyResponse::parse(b"OK").unwrap();
        assert_eq!(legacy, IdentifyResponse::default());

        assert!(IdentifyResponse::parse(b"{not json").is_err());
    }

    #[test]
    fn test_name_validation() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for valid in ["events", "a.b_c-d", "clicks#ephemeral", longest.as_str()] {
            assert!(validate_topic_name(valid).is_ok(), "{valid} should be valid");
        }
        for invalid in ["", "has space", "slash/name", "#ephemeral", too_long.as_str()] {
            assert!(
                validate_channel_name(invalid).is_err(),
                "{invalid} should be invalid"
            );
        }
    }
}
