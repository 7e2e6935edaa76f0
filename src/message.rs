//! In-memory representation of a wire frame header and the message types
//! delivered to application code.
//!
//! The header is serialized as a UTF-8 JSON object with PascalCase field
//! names, terminated by two consecutive line terminators, followed by exactly
//! `ContentLength` payload bytes. Timestamps use the fixed offset format
//! `YYYY-MM-DD HH:MM:SS.fff+HH:MM` and are always emitted in UTC.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FramingError, LinkResult};

/// Chrono format string for `Expiration` and `SenderTimestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f%:z";

/// Exact byte length of a preshared key.
pub const PRESHARED_KEY_LEN: usize = 16;

/// The delimiter emitted after the JSON header. Readers additionally accept
/// the two-byte `LF LF` form produced by LF-only peers.
pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

/// Arbitrary user metadata carried in the frame header.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// MessageStatus
// ---------------------------------------------------------------------------

/// Connection-control status carried by every frame.
///
/// Serialized as the stringified variant name, e.g. `"AuthRequired"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Ordinary application data.
    #[default]
    Normal,
    /// Server demands authentication before it will route application data.
    AuthRequired,
    /// Client presents its preshared key.
    AuthRequested,
    /// Server accepted the presented key.
    AuthSuccess,
    /// Server rejected the presented key.
    AuthFailure,
    /// Server evicted or kicked the session.
    Removed,
    /// Graceful disconnect announcement.
    Disconnecting,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageStatus::Normal => "Normal",
            MessageStatus::AuthRequired => "AuthRequired",
            MessageStatus::AuthRequested => "AuthRequested",
            MessageStatus::AuthSuccess => "AuthSuccess",
            MessageStatus::AuthFailure => "AuthFailure",
            MessageStatus::Removed => "Removed",
            MessageStatus::Disconnecting => "Disconnecting",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// FrameHeader
// ---------------------------------------------------------------------------

/// The parsed or to-be-serialized JSON header of a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FrameHeader {
    /// Exact byte count of the payload following the header delimiter.
    pub content_length: u64,

    /// Preshared key material, present only on `AuthRequested` frames.
    /// Base64 on the wire; exactly 16 bytes decoded.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "psk_base64")]
    pub preshared_key: Option<[u8; PRESHARED_KEY_LEN]>,

    /// Connection-control status.
    #[serde(default)]
    pub status: MessageStatus,

    /// User metadata. An absent field deserializes to an empty map.
    #[serde(default)]
    pub metadata: Metadata,

    /// True when this frame opens a synchronous exchange.
    #[serde(default)]
    pub sync_request: bool,

    /// True when this frame answers a synchronous exchange.
    #[serde(default)]
    pub sync_response: bool,

    /// Deadline for the synchronous exchange. Present iff a sync flag is set.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp_opt")]
    pub expiration: Option<DateTime<Utc>>,

    /// 36-character identifier correlating a sync request with its response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_guid: Option<String>,

    /// Sender's wall clock at send time, for clock-skew compensation.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp_opt")]
    pub sender_timestamp: Option<DateTime<Utc>>,
}

impl FrameHeader {
    /// An ordinary data frame.
    pub fn normal(metadata: Metadata, content_length: u64) -> Self {
        FrameHeader {
            content_length,
            preshared_key: None,
            status: MessageStatus::Normal,
            metadata,
            sync_request: false,
            sync_response: false,
            expiration: None,
            conversation_guid: None,
            sender_timestamp: Some(Utc::now()),
        }
    }

    /// A zero-payload control frame carrying only a status.
    pub fn control(status: MessageStatus) -> Self {
        FrameHeader {
            content_length: 0,
            preshared_key: None,
            status,
            metadata: Metadata::new(),
            sync_request: false,
            sync_response: false,
            expiration: None,
            conversation_guid: None,
            sender_timestamp: Some(Utc::now()),
        }
    }

    /// The client's authentication frame presenting its preshared key.
    pub fn auth_requested(key: [u8; PRESHARED_KEY_LEN]) -> Self {
        FrameHeader {
            preshared_key: Some(key),
            ..FrameHeader::control(MessageStatus::AuthRequested)
        }
    }

    /// A frame opening a synchronous exchange.
    pub fn sync_request(
        conversation_guid: String,
        expiration: DateTime<Utc>,
        metadata: Metadata,
        content_length: u64,
    ) -> Self {
        FrameHeader {
            sync_request: true,
            expiration: Some(expiration),
            conversation_guid: Some(conversation_guid),
            ..FrameHeader::normal(metadata, content_length)
        }
    }

    /// A frame answering a synchronous exchange. The conversation GUID and
    /// expiration are copied verbatim from the originating request.
    pub fn sync_response(
        conversation_guid: String,
        expiration: DateTime<Utc>,
        metadata: Metadata,
        content_length: u64,
    ) -> Self {
        FrameHeader {
            sync_response: true,
            expiration: Some(expiration),
            conversation_guid: Some(conversation_guid),
            ..FrameHeader::normal(metadata, content_length)
        }
    }

    /// Enforce the structural invariants of §message construction: mutual
    /// exclusion of the sync flags, and expiration/GUID presence tied to them.
    pub fn validate(&self) -> Result<(), FramingError> {
        if self.sync_request && self.sync_response {
            return Err(FramingError::MalformedHeader(
                "SyncRequest and SyncResponse are mutually exclusive".into(),
            ));
        }
        let is_sync = self.sync_request || self.sync_response;
        if is_sync {
            if self.expiration.is_none() {
                return Err(FramingError::MalformedHeader(
                    "sync frames require Expiration".into(),
                ));
            }
            match &self.conversation_guid {
                None => {
                    return Err(FramingError::MalformedHeader(
                        "sync frames require ConversationGuid".into(),
                    ));
                }
                Some(guid) if guid.len() != 36 => {
                    return Err(FramingError::MalformedHeader(format!(
                        "ConversationGuid must be 36 characters, got {}",
                        guid.len()
                    )));
                }
                Some(_) => {}
            }
        } else if self.expiration.is_some() || self.conversation_guid.is_some() {
            return Err(FramingError::MalformedHeader(
                "Expiration and ConversationGuid are only valid on sync frames".into(),
            ));
        }
        Ok(())
    }

    /// Serialize the header plus delimiter into the bytes of a single write.
    pub fn header_bytes(&self) -> LinkResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)
            .map_err(|e| FramingError::MalformedHeader(format!("serialize: {e}")))?;
        bytes.extend_from_slice(HEADER_DELIMITER);
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Delivered message types
// ---------------------------------------------------------------------------

/// A fully buffered inbound message as handed to the application.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Metadata copied from the frame header.
    pub metadata: Metadata,
    /// The complete payload.
    pub payload: Bytes,
}

/// An inbound synchronous request awaiting an application-supplied answer.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Conversation identifier the response must echo.
    pub conversation_guid: String,
    /// Skew-compensated deadline for the exchange.
    pub expiration: DateTime<Utc>,
    /// Metadata copied from the frame header.
    pub metadata: Metadata,
    /// The complete request payload.
    pub payload: Bytes,
}

/// The answer to a synchronous exchange: either returned by a sync-request
/// handler, or handed back to a `send_and_wait` caller.
#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    /// Metadata to carry on (or carried by) the response frame.
    pub metadata: Metadata,
    /// The response payload.
    pub payload: Bytes,
}

impl SyncResponse {
    /// Build a response from any payload, with empty metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        SyncResponse {
            metadata: Metadata::new(),
            payload: payload.into(),
        }
    }

    /// Build a response carrying metadata.
    pub fn with_metadata(metadata: Metadata, payload: impl Into<Bytes>) -> Self {
        SyncResponse {
            metadata,
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Format a timestamp in the wire representation (UTC offset form).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire timestamp with any offset into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_str(s, TIMESTAMP_FORMAT).map(|dt| dt.with_timezone(&Utc))
}

mod timestamp_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => parse_timestamp(&s)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("bad timestamp {s:?}: {e}"))),
        }
    }
}

mod psk_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<[u8; PRESHARED_KEY_LEN]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(key) => serializer.serialize_str(&BASE64.encode(key)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; PRESHARED_KEY_LEN]>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => {
                let decoded = BASE64
                    .decode(&s)
                    .map_err(|e| serde::de::Error::custom(format!("bad PresharedKey: {e}")))?;
                let key: [u8; PRESHARED_KEY_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
                    serde::de::Error::custom(format!(
                        "PresharedKey must decode to {PRESHARED_KEY_LEN} bytes, got {}",
                        v.len()
                    ))
                })?;
                Ok(Some(key))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
