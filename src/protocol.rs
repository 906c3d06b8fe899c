//! Wire protocol for the realtime agent backend.
//!
//! Everything that crosses the WebSocket is defined here: the outbound
//! client events, the inbound server events (including the several tag
//! spellings the backend uses for the same fact), and the single
//! canonical text-extraction path for history items. PCM conversion
//! helpers live here too since both audio components share them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Sample rate used in both directions.
pub const SAMPLE_RATE: u32 = 24_000;
/// Mono audio only.
pub const CHANNELS: u8 = 1;

/// Client -> backend messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// One capture block of PCM16 samples.
    Audio { data: Vec<i16> },
    /// A typed user utterance.
    Text { text: String },
    /// Barge-in: ask the backend to stop the current response.
    Interrupt,
}

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One content part of a history item. The backend populates `text` for
/// typed content and `transcript` for speech; either may be missing or
/// empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

/// Backend-side record of one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HistoryItem {
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// Backend -> client messages, tagged by `type`.
///
/// The backend describes the same underlying facts through several tag
/// spellings (`response.text.delta` and `response.audio_transcript.delta`
/// are one event to us); aliases collapse them at the parse boundary so
/// the rest of the crate sees one closed variant set.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// One chunk of base64 PCM16 speech audio.
    #[serde(rename = "audio")]
    Audio {
        audio: String,
        #[serde(default)]
        item_id: Option<String>,
    },
    /// Full history resync, optionally with a pre-extracted summary of
    /// the last assistant turn.
    #[serde(rename = "history_updated", alias = "history_snapshot")]
    HistoryUpdated {
        #[serde(default)]
        last_assistant_message: Option<String>,
        #[serde(default)]
        history: Vec<HistoryItem>,
    },
    /// One new history item, or just its pre-extracted text.
    #[serde(rename = "history_added")]
    HistoryAdded {
        #[serde(default)]
        item: Option<HistoryItem>,
        #[serde(default)]
        text: Option<String>,
    },
    /// One-time backlog replay after (re)connecting.
    #[serde(rename = "history_loaded")]
    HistoryLoaded {
        #[serde(default)]
        history: Vec<HistoryItem>,
    },
    /// Incremental fragment of the in-progress assistant turn.
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.text.delta"
    )]
    TranscriptDelta { delta: String },
    /// The in-progress assistant turn is complete.
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.text.done"
    )]
    TranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },
    /// Raw model events the backend did not rewrite into one of the
    /// shapes above; only the transcript ones carry anything we use.
    #[serde(rename = "raw_model_event")]
    RawModelEvent {
        raw_event: String,
        #[serde(default)]
        delta: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "agent_start")]
    AgentStart {
        #[serde(default)]
        agent: Option<String>,
    },
    #[serde(rename = "agent_end")]
    AgentEnd {
        #[serde(default)]
        agent: Option<String>,
    },
    #[serde(rename = "handoff")]
    Handoff {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    #[serde(rename = "tool_start")]
    ToolStart {
        #[serde(default)]
        tool: Option<String>,
    },
    #[serde(rename = "tool_end")]
    ToolEnd {
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        output: Option<String>,
    },
    /// The backend finished streaming audio for the current turn.
    #[serde(rename = "audio_end")]
    AudioEnd,
    /// The backend truncated its own audio; local playback should flush.
    #[serde(rename = "audio_interrupted")]
    AudioInterrupted,
    #[serde(rename = "guardrail_tripped")]
    GuardrailTripped {
        #[serde(default)]
        message: Option<String>,
    },
    /// Plumbing check message the backend sends right after connect.
    #[serde(rename = "debug_text")]
    DebugText {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "error")]
    Error { error: String },
    /// Any tag we do not know; logged and dropped by the dispatcher.
    #[serde(other)]
    Unknown,
}

/// Parse one inbound frame into a tagged event.
pub fn parse_server_event(text: &str) -> Result<ServerEvent> {
    Ok(serde_json::from_str(text)?)
}

/// Canonical text extraction from a history item.
///
/// Per part: `text` wins if non-empty, else `transcript` if non-empty.
/// Part extracts are joined with single spaces and trimmed; an item whose
/// concatenation ends up empty yields `None` and must not surface as a
/// message. Every place in the crate that pulls text out of a history
/// item goes through here.
pub fn extract_item_text(item: &HistoryItem) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in &item.content {
        if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
            parts.push(text);
        } else if let Some(transcript) = part.transcript.as_deref().filter(|t| !t.is_empty()) {
            parts.push(transcript);
        }
    }
    let joined = parts.join(" ").trim().to_string();
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Encode one block of float samples as wire-ready PCM16.
///
/// Samples are clamped to [-1, 1] and scaled by 32767, preserving order.
pub fn encode_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// The inverse mapping used on the playback side.
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Decode raw little-endian PCM16 bytes into samples.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::DecodeFailure(format!(
            "odd PCM payload length: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Decode the base64 envelope around an inbound audio chunk.
pub fn decode_audio_envelope(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| SessionError::DecodeFailure(format!("invalid base64 audio: {e}")))
}
