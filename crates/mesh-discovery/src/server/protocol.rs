// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery wire protocol.
//!
//! Fixed binary layout, every multi-byte integer little-endian. Each message
//! travels inside a length-prefixed frame on the stream.
//!
//! Wire format:
//! ```text
//! frame:    +----------------+----------------------+
//!           | Length (4B LE) | DiscoveryMessage     |
//!           +----------------+----------------------+
//!
//! message:  +-------+-----------+-------------+------------+----------------+-----------+
//!           | state | port (2B) | host len 1B | host bytes | payload len 8B | payload   |
//!           +-------+-----------+-------------+------------+----------------+-----------+
//! ```
//!
//! A payload length of 0 means "no payload". An explicitly empty payload
//! encodes the same way, so the two are indistinguishable after decoding.

/// Size of the outer frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Smallest possible message: state + port + host len + payload len.
pub const MIN_MESSAGE_SIZE: usize = 1 + 2 + 1 + 8;

/// Largest host name the one-byte length field can carry.
pub const MAX_HOST_LEN: usize = u8::MAX as usize;

/// Body of every `Error` response.
pub const BAD_MESSAGE_BODY: &str = r#"{"ERROR":"BAD MESSAGE"}"#;

/// Discovery state tag carried in the first byte of every message.
///
/// Tags the server does not know still decode, as [`DiscoveryState::Unknown`];
/// the registry is the layer that rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryState {
    Connect,
    Register,
    GetInputQs,
    GetOutputQs,
    Error,
    Unknown(u8),
}

impl DiscoveryState {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            0 => Self::Connect,
            1 => Self::Register,
            2 => Self::GetInputQs,
            3 => Self::GetOutputQs,
            255 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Connect => 0,
            Self::Register => 1,
            Self::GetInputQs => 2,
            Self::GetOutputQs => 3,
            Self::Error => 255,
            Self::Unknown(tag) => tag,
        }
    }
}

impl From<u8> for DiscoveryState {
    fn from(tag: u8) -> Self {
        Self::from_u8(tag)
    }
}

impl From<DiscoveryState> for u8 {
    fn from(state: DiscoveryState) -> Self {
        state.as_u8()
    }
}

/// One request or response unit of the discovery protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub state: DiscoveryState,
    /// Peer port; 0 on a `Register` request asks the server to pick one.
    pub port: u16,
    /// Host the peer advertises.
    pub host: String,
    /// Comma-separated queue names on requests, a JSON binding table on
    /// responses, or an error body.
    pub payload: Option<String>,
}

impl DiscoveryMessage {
    pub fn new(
        state: DiscoveryState,
        port: u16,
        host: impl Into<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            state,
            port,
            host: host.into(),
            payload,
        }
    }

    pub fn connect(host: impl Into<String>) -> Self {
        Self::new(DiscoveryState::Connect, 0, host, None)
    }

    pub fn register(host: impl Into<String>, port: u16) -> Self {
        Self::new(DiscoveryState::Register, port, host, None)
    }

    /// Bind `queues` as inputs of `host:port` (or just poll when empty).
    pub fn get_input_qs(host: impl Into<String>, port: u16, queues: &[&str]) -> Self {
        Self::new(
            DiscoveryState::GetInputQs,
            port,
            host,
            join_queue_list(queues),
        )
    }

    /// Bind `queues` as outputs of `host:port` (or just poll when empty).
    pub fn get_output_qs(host: impl Into<String>, port: u16, queues: &[&str]) -> Self {
        Self::new(
            DiscoveryState::GetOutputQs,
            port,
            host,
            join_queue_list(queues),
        )
    }

    /// The fixed error response, echoing the requester's host.
    pub fn error(host: impl Into<String>) -> Self {
        Self::new(
            DiscoveryState::Error,
            0,
            host,
            Some(BAD_MESSAGE_BODY.to_string()),
        )
    }

    /// `"<host>:<port>"`, the identity this message binds queues to.
    pub fn transport_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Payload with the empty string folded into `None`.
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().filter(|p| !p.is_empty())
    }

    /// Encode the message body (without the frame prefix).
    pub fn encode(&self) -> Vec<u8> {
        let host = truncate_utf8(&self.host, MAX_HOST_LEN);
        let payload = self.payload_str().unwrap_or("");

        let mut buf = Vec::with_capacity(MIN_MESSAGE_SIZE + host.len() + payload.len());
        buf.push(self.state.as_u8());
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.push(host.len() as u8);
        buf.extend_from_slice(host.as_bytes());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(payload.as_bytes());
        buf
    }

    /// Encode the message with its `[u32 LE length]` frame prefix.
    pub fn encode_frame(&self) -> Vec<u8> {
        let body = self.encode();
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a message body. Bytes after the payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(buf);

        let state = DiscoveryState::from_u8(reader.u8()?);
        let port = u16::from_le_bytes(reader.array()?);

        let host_len = reader.u8()? as usize;
        let host = reader.utf8(host_len, "host")?;

        let payload_len = u64::from_le_bytes(reader.array()?);
        let payload = if payload_len == 0 {
            None
        } else {
            let len = usize::try_from(payload_len).map_err(|_| ProtocolError::Truncated {
                needed: usize::MAX,
                have: reader.remaining(),
            })?;
            Some(reader.utf8(len, "payload")?)
        };

        Ok(Self {
            state,
            port,
            host,
            payload,
        })
    }
}

fn join_queue_list(queues: &[&str]) -> Option<String> {
    if queues.is_empty() {
        None
    } else {
        Some(queues.join(","))
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Bounds-checked cursor over a message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if len > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn utf8(&mut self, len: usize, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }
}

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A declared length runs past the end of the buffer.
    #[error("malformed message: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("malformed message: {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tags() {
        assert_eq!(DiscoveryState::from_u8(0), DiscoveryState::Connect);
        assert_eq!(DiscoveryState::from_u8(1), DiscoveryState::Register);
        assert_eq!(DiscoveryState::from_u8(2), DiscoveryState::GetInputQs);
        assert_eq!(DiscoveryState::from_u8(3), DiscoveryState::GetOutputQs);
        assert_eq!(DiscoveryState::from_u8(255), DiscoveryState::Error);
        assert_eq!(DiscoveryState::from_u8(123), DiscoveryState::Unknown(123));

        for tag in 0..=u8::MAX {
            assert_eq!(DiscoveryState::from_u8(tag).as_u8(), tag);
        }
    }

    #[test]
    fn test_encode_layout() {
        let msg = DiscoveryMessage::new(
            DiscoveryState::GetInputQs,
            0x1770,
            "h1",
            Some("orders".into()),
        );
        let bytes = msg.encode();

        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..3], &[0x70, 0x17]);
        assert_eq!(bytes[3], 2);
        assert_eq!(&bytes[4..6], b"h1");
        assert_eq!(&bytes[6..14], &6u64.to_le_bytes());
        assert_eq!(&bytes[14..], b"orders");
    }

    #[test]
    fn test_frame_prefix() {
        let msg = DiscoveryMessage::connect("localhost");
        let frame = msg.encode_frame();
        let body_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(body_len, frame.len() - FRAME_HEADER_SIZE);
        assert_eq!(&frame[FRAME_HEADER_SIZE..], msg.encode().as_slice());
    }

    #[test]
    fn test_roundtrip() {
        let msg = DiscoveryMessage::new(
            DiscoveryState::GetOutputQs,
            7000,
            "h2",
            Some("orders,fills".into()),
        );
        assert_eq!(DiscoveryMessage::decode(&msg.encode()).unwrap(), msg);

        let unknown = DiscoveryMessage::new(DiscoveryState::Unknown(123), 1, "x", None);
        assert_eq!(DiscoveryMessage::decode(&unknown.encode()).unwrap(), unknown);
    }

    #[test]
    fn test_empty_payload_decodes_as_none() {
        // The wire cannot tell "no payload" from "empty payload".
        let msg = DiscoveryMessage::new(DiscoveryState::Register, 0, "h1", Some(String::new()));
        let decoded = DiscoveryMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn test_decode_truncated_host() {
        let mut bytes = DiscoveryMessage::connect("hostname").encode();
        bytes.truncate(6);
        assert!(matches!(
            DiscoveryMessage::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_payload_length_overrun() {
        let mut bytes = DiscoveryMessage::connect("h").encode();
        let len_at = bytes.len() - 8;
        bytes[len_at..].copy_from_slice(&1000u64.to_le_bytes());
        bytes.extend_from_slice(b"short");

        let err = DiscoveryMessage::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                needed: 1000,
                have: 5
            }
        );
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert!(DiscoveryMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let bytes = [0u8, 0, 0, 2, 0xff, 0xfe, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            DiscoveryMessage::decode(&bytes),
            Err(ProtocolError::InvalidUtf8("host"))
        );
    }

    #[test]
    fn test_long_host_truncated_on_char_boundary() {
        let host = "é".repeat(200); // 400 bytes
        let msg = DiscoveryMessage::connect(host);
        let decoded = DiscoveryMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.host.len(), 254);
        assert!(decoded.host.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_error_message() {
        let msg = DiscoveryMessage::error("h1");
        assert_eq!(msg.state, DiscoveryState::Error);
        assert_eq!(msg.port, 0);
        assert_eq!(msg.host, "h1");
        assert_eq!(msg.payload.as_deref(), Some(BAD_MESSAGE_BODY));
    }

    #[test]
    fn test_queue_list_helpers() {
        let msg = DiscoveryMessage::get_input_qs("h1", 6000, &["a", "b"]);
        assert_eq!(msg.payload.as_deref(), Some("a,b"));
        assert_eq!(msg.transport_id(), "h1:6000");

        let poll = DiscoveryMessage::get_output_qs("h1", 6000, &[]);
        assert_eq!(poll.payload, None);
    }
}
