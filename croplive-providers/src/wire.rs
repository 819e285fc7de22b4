//
// Gemini Live wire format: JSON frames over a persistent WebSocket.
//
// Client -> server: one `setup` frame at connect, `clientContent` turns for
// prompted frames and user text, `realtimeInput` media chunks for context
// frames and audio. Server -> client: `setupComplete` once, then
// `serverContent` turns whose parts carry text or inline base64 PCM.

use anyhow::{Context, anyhow};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PCM_INPUT: &str = "audio/pcm;rate=16000";

const MIME_PCM_PREFIX: &str = "audio/pcm";

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// One-time handshake describing the response modality and system prompt.
pub fn build_setup_message(model: &str, system_instruction: &str) -> String {
    json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
            },
            "systemInstruction": {
                "parts": [{ "text": system_instruction }],
            },
        },
    })
    .to_string()
}

/// A frame paired with the analysis prompt, sent as a complete user turn to
/// force a model response.
pub fn build_prompted_frame_message(jpeg: &[u8], prompt: &str) -> String {
    json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": MIME_JPEG, "data": b64(jpeg) } },
                    { "text": prompt },
                ],
            }],
            "turnComplete": true,
        },
    })
    .to_string()
}

/// A complete user text turn.
pub fn build_text_turn_message(text: &str) -> String {
    json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }],
            }],
            "turnComplete": true,
        },
    })
    .to_string()
}

/// Context-only media input (unprompted frames, audio chunks). Does not
/// trigger a model turn.
pub fn build_media_chunk_message(mime_type: &str, data: &[u8]) -> String {
    json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": mime_type, "data": b64(data) }],
        },
    })
    .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerPart {
    Text(String),
    /// Inline PCM response audio, already base64-decoded.
    InlineAudio { mime_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetupComplete,
    Content {
        parts: Vec<ServerPart>,
        turn_complete: bool,
        interrupted: bool,
    },
    /// Tool invocations are out of scope; surfaced so the caller can log them.
    ToolCall(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<RawServerContent>,
    tool_call: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<RawModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct RawModelTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    text: Option<String>,
    inline_data: Option<RawInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInlineData {
    mime_type: String,
    data: String,
}

pub fn parse_server_message(s: &str) -> anyhow::Result<ServerMessage> {
    let raw: RawServerMessage = serde_json::from_str(s).context("decode server JSON")?;

    if raw.setup_complete.is_some() {
        return Ok(ServerMessage::SetupComplete);
    }

    if let Some(tool_call) = raw.tool_call {
        return Ok(ServerMessage::ToolCall(tool_call));
    }

    let Some(content) = raw.server_content else {
        return Err(anyhow!("unrecognized server message"));
    };

    let mut parts = Vec::new();
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text {
                parts.push(ServerPart::Text(text));
                continue;
            }
            if let Some(inline) = part.inline_data {
                if !inline.mime_type.starts_with(MIME_PCM_PREFIX) {
                    // Only PCM response audio is expected inbound.
                    continue;
                }
                let data = base64::engine::general_purpose::STANDARD
                    .decode(inline.data.as_bytes())
                    .context("decode inline audio base64")?;
                parts.push(ServerPart::InlineAudio {
                    mime_type: inline.mime_type,
                    data,
                });
            }
        }
    }

    Ok(ServerMessage::Content {
        parts,
        turn_complete: content.turn_complete,
        interrupted: content.interrupted,
    })
}
