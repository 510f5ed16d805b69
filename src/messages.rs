//! Frame types for the generation service's WebSocket protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

// ============================================================================
// Client -> server
// ============================================================================

/// Operation kinds a caller can send over the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GenerateImage,
    GenerateVideo,
    GenerateLlm,
    Upscale,
    GenerateStt,
    GenerateTts,
    GetSettings,
    UpdateSettings,
    GetUsage,
    GetRateLimits,
}

impl RequestKind {
    /// The frame `type` tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::GenerateImage => "generate_image",
            RequestKind::GenerateVideo => "generate_video",
            RequestKind::GenerateLlm => "generate_llm",
            RequestKind::Upscale => "generate_upscale",
            RequestKind::GenerateStt => "generate_stt",
            RequestKind::GenerateTts => "generate_tts",
            RequestKind::GetSettings => "get_settings",
            RequestKind::UpdateSettings => "update_settings",
            RequestKind::GetUsage => "get_usage",
            RequestKind::GetRateLimits => "get_rate_limits",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame sent to the server.
#[derive(Debug, Clone, Serialize)]
pub struct ClientFrame {
    /// The frame type.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Request payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Correlation identifier.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ClientFrame {
    /// Creates the credential frame sent right after the socket opens.
    pub fn auth(api_key: &str) -> Self {
        let mut data = Map::new();
        data.insert("apiKey".to_string(), Value::String(api_key.to_string()));
        Self {
            msg_type: "auth".to_string(),
            data: Some(Value::Object(data)),
            request_id: None,
        }
    }

    /// Creates a correlated request frame. A `null` payload is omitted.
    pub fn request(kind: RequestKind, data: Value, request_id: &str) -> Self {
        Self {
            msg_type: kind.as_str().to_string(),
            data: if data.is_null() { None } else { Some(data) },
            request_id: Some(request_id.to_string()),
        }
    }

    /// Creates a cancel frame for an in-flight request.
    pub fn cancel(request_id: &str) -> Self {
        Self {
            msg_type: "cancel".to_string(),
            data: None,
            request_id: Some(request_id.to_string()),
        }
    }

    /// Serializes the frame to JSON text.
    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Generic frame shape, used for initial parsing.
#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// Which incremental stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Text generation tokens.
    Llm,
    /// Transcription text.
    Stt,
    /// Synthesized audio.
    Tts,
}

/// Account query answered by a plain response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Settings,
    Usage,
    RateLimits,
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Credential accepted.
    AuthSuccess,
    /// Credential rejected.
    AuthFailure { message: String },
    /// Protocol error, correlated when `request_id` is set.
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
    },
    /// Terminal success for a generation request.
    Complete {
        request_id: Option<String>,
        result: Value,
    },
    /// Incremental data for a streaming request.
    Chunk {
        request_id: Option<String>,
        kind: ChunkKind,
        data: Value,
    },
    /// Terminal success for an account query.
    Response {
        request_id: Option<String>,
        kind: ResponseKind,
        data: Value,
    },
    /// A tag this client does not know.
    Unknown { msg_type: String },
}

impl InboundFrame {
    /// Parses one JSON text frame.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let RawFrame {
            msg_type,
            request_id,
            data,
            message,
            code,
        } = raw;
        let data = data.unwrap_or(Value::Null);

        let frame = match msg_type.as_str() {
            "auth_success" => InboundFrame::AuthSuccess,
            "auth_error" | "auth_failed" => InboundFrame::AuthFailure {
                message: field_str(&data, "message")
                    .or(message)
                    .unwrap_or_else(|| "authentication rejected".to_string()),
            },
            "error" => InboundFrame::Error {
                request_id,
                code: data
                    .get("code")
                    .or(code.as_ref())
                    .map(code_to_string)
                    .unwrap_or_else(|| "server_error".to_string()),
                message: field_str(&data, "message")
                    .or(message)
                    .unwrap_or_else(|| "unknown server error".to_string()),
            },
            "generation_complete" => {
                let result = match data {
                    Value::Object(mut map) if map.contains_key("result") => {
                        map.remove("result").unwrap_or(Value::Null)
                    }
                    other => other,
                };
                InboundFrame::Complete { request_id, result }
            }
            "llm_chunk" => InboundFrame::Chunk {
                request_id,
                kind: ChunkKind::Llm,
                data,
            },
            "stt_chunk" => InboundFrame::Chunk {
                request_id,
                kind: ChunkKind::Stt,
                data,
            },
            "tts_chunk" => InboundFrame::Chunk {
                request_id,
                kind: ChunkKind::Tts,
                data,
            },
            "settings" => InboundFrame::Response {
                request_id,
                kind: ResponseKind::Settings,
                data,
            },
            "usage" => InboundFrame::Response {
                request_id,
                kind: ResponseKind::Usage,
                data,
            },
            "rate_limits" => InboundFrame::Response {
                request_id,
                kind: ResponseKind::RateLimits,
                data,
            },
            _ => InboundFrame::Unknown { msg_type },
        };
        Ok(frame)
    }
}

fn field_str(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn code_to_string(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
