//! Wire protocol for the control-plane link.
//!
//! Each message is a JSON envelope `{route, correlationId?, data}` carried
//! in a length-prefixed frame: `len:u32 (big-endian) | payload`. Requests
//! and responses share the stream with fire-and-forget events; a response
//! is paired to its request by the correlation id.
//!
//! Keepalive is an ordinary `ping` envelope. Intermediaries (nginx and the
//! like) close idle connections, so the write loop sends one on a fixed
//! interval; the control plane ignores it.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DepotError, Result};

/// Client identifier presented during the handshake.
pub const CLIENT_NAME: &str = "depot";

/// Upper bound on a single frame. Envelopes are small JSON objects; anything
/// near this limit means the stream is corrupt.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Envelope payload: a free-form JSON mapping.
pub type Payload = serde_json::Map<String, Value>;

/// Build a payload from literal key/value pairs.
pub fn payload<const N: usize>(pairs: [(&str, Value); N]) -> Payload {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Read a string field out of a payload, tolerating absent or mistyped
/// values by returning `None`.
pub fn string_field(data: &Payload, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

// =============================================================================
// Routes
// =============================================================================

/// The closed set of route names exchanged with the control plane.
///
/// Inbound commands: `delete`, `expect-upload`. Everything else is either
/// sent by us or only ever seen as a correlated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Hello,
    Ping,
    Bye,
    Delete,
    Deleted,
    ExpectUpload,
    Uploaded,
    Downloaded,
    DiskUsage,
    VerifyDownloadToken,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Ping => "ping",
            Self::Bye => "bye",
            Self::Delete => "delete",
            Self::Deleted => "deleted",
            Self::ExpectUpload => "expect-upload",
            Self::Uploaded => "uploaded",
            Self::Downloaded => "downloaded",
            Self::DiskUsage => "disk-usage",
            Self::VerifyDownloadToken => "verify-download-token",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "hello" => Some(Self::Hello),
            "ping" => Some(Self::Ping),
            "bye" => Some(Self::Bye),
            "delete" => Some(Self::Delete),
            "deleted" => Some(Self::Deleted),
            "expect-upload" => Some(Self::ExpectUpload),
            "uploaded" => Some(Self::Uploaded),
            "downloaded" => Some(Self::Downloaded),
            "disk-usage" => Some(Self::DiskUsage),
            "verify-download-token" => Some(Self::VerifyDownloadToken),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// The message unit exchanged over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub route: String,

    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub data: Payload,
}

impl Envelope {
    /// Fire-and-forget event with no correlation id.
    pub fn event(route: Route, data: Payload) -> Self {
        Self {
            route: route.as_str().to_string(),
            correlation_id: None,
            data,
        }
    }

    /// Outbound request expecting a correlated response.
    pub fn request(route: Route, correlation_id: String, data: Payload) -> Self {
        Self {
            route: route.as_str().to_string(),
            correlation_id: Some(correlation_id),
            data,
        }
    }

    /// Ack for an inbound command, echoing its correlation id.
    pub fn reply(route: Route, correlation_id: Option<String>, data: Payload) -> Self {
        Self {
            route: route.as_str().to_string(),
            correlation_id,
            data,
        }
    }

    /// Encode as a length-prefixed frame ready for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(DepotError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

// =============================================================================
// Frame I/O
// =============================================================================

/// Read one frame payload off the wire.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DepotError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Write a pre-encoded frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Bytes) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_route_round_trip() {
        for route in [
            Route::Hello,
            Route::Ping,
            Route::Bye,
            Route::Delete,
            Route::Deleted,
            Route::ExpectUpload,
            Route::Uploaded,
            Route::Downloaded,
            Route::DiskUsage,
            Route::VerifyDownloadToken,
        ] {
            assert_eq!(Route::parse(route.as_str()), Some(route));
        }
        assert_eq!(Route::parse("compact"), None);
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let env = Envelope::request(
            Route::VerifyDownloadToken,
            "abc".to_string(),
            payload([("id", json!("x"))]),
        );
        let encoded = serde_json::to_value(&env).unwrap();

        assert_eq!(encoded["route"], "verify-download-token");
        assert_eq!(encoded["correlationId"], "abc");
        assert_eq!(encoded["data"]["id"], "x");
    }

    #[test]
    fn test_event_omits_correlation_id() {
        let env = Envelope::event(Route::Downloaded, Payload::new());
        let encoded = serde_json::to_string(&env).unwrap();
        assert!(!encoded.contains("correlationId"));
    }

    #[test]
    fn test_decode_tolerates_missing_data() {
        let env = Envelope::decode(br#"{"route":"ping"}"#).unwrap();
        assert_eq!(env.route, "ping");
        assert!(env.correlation_id.is_none());
        assert!(env.data.is_empty());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let env = Envelope::event(Route::Uploaded, payload([("size", json!(42))]));
        let frame = env.encode().unwrap();

        let mut wire = Cursor::new(Vec::new());
        write_frame(&mut wire, &frame).await.unwrap();

        let mut cursor = Cursor::new(wire.into_inner());
        let raw = read_frame(&mut cursor).await.unwrap();
        let decoded = Envelope::decode(&raw).unwrap();

        assert_eq!(decoded.route, "uploaded");
        assert_eq!(decoded.data.get("size").and_then(|v| v.as_u64()), Some(42));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        wire.extend_from_slice(b"junk");

        let mut cursor = Cursor::new(wire);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, DepotError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_string_field() {
        let data = payload([("id", json!("abc")), ("count", json!(3))]);
        assert_eq!(string_field(&data, "id").as_deref(), Some("abc"));
        assert_eq!(string_field(&data, "count"), None);
        assert_eq!(string_field(&data, "missing"), None);
    }
}
