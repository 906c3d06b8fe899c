//! Event reconciler: collapses the overlapping event shapes the backend
//! uses to describe the same conversation turns into one message log.
//!
//! The backend may redundantly describe one turn via a cheap summary
//! field, a full history array, and a stream of deltas. A strict
//! extraction priority plus a seen-id set guarantees each logical item
//! surfaces exactly once. State here is session-scoped: reset on connect
//! and discarded on disconnect, never reused across sessions.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::protocol::{extract_item_text, HistoryItem, Role, ServerEvent};

/// One finalized transcript entry. Immutable once emitted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Session-status changes surfaced alongside the message log.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    AgentStarted(Option<String>),
    AgentEnded(Option<String>),
    Handoff {
        from: Option<String>,
        to: Option<String>,
    },
    ToolStarted(Option<String>),
    ToolEnded(Option<String>),
    /// The backend finished streaming audio for the current turn.
    AudioDone,
    GuardrailTripped(Option<String>),
    /// Explicit error event from the remote side; never fatal here.
    BackendError(String),
}

/// What one inbound event turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerUpdate {
    /// A finalized message, appended to the log exactly once.
    Message(Message),
    /// The accumulated text of the in-progress assistant turn.
    Partial(String),
    Status(StatusUpdate),
}

/// State machine over the tagged event stream.
#[derive(Debug, Default)]
pub struct Reconciler {
    seen: HashSet<String>,
    pending: String,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all per-session state.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.pending.clear();
    }

    /// The in-progress assistant turn, if any.
    pub fn partial(&self) -> Option<&str> {
        if self.pending.is_empty() {
            None
        } else {
            Some(&self.pending)
        }
    }

    /// Apply one inbound event and return whatever it surfaced.
    pub fn apply(&mut self, event: ServerEvent) -> Vec<ReconcilerUpdate> {
        match event {
            // Audio is routed to playback before the reconciler; nothing
            // to do if a chunk ends up here anyway.
            ServerEvent::Audio { .. } | ServerEvent::AudioInterrupted => Vec::new(),

            ServerEvent::HistoryUpdated {
                last_assistant_message,
                history,
            } => self.on_history_updated(last_assistant_message, history),

            ServerEvent::HistoryAdded { item, text } => self.on_history_added(item, text),

            ServerEvent::HistoryLoaded { history } => self.on_history_loaded(history),

            ServerEvent::TranscriptDelta { delta } => self.on_delta(&delta),

            ServerEvent::TranscriptDone { transcript } => self.on_done(transcript),

            ServerEvent::RawModelEvent {
                raw_event,
                delta,
                transcript,
            } => match raw_event.as_str() {
                "transcript_delta" => match delta {
                    Some(delta) => self.on_delta(&delta),
                    None => Vec::new(),
                },
                "transcript_done" => self.on_done(transcript),
                other => {
                    debug!("ignoring raw model event: {}", other);
                    Vec::new()
                }
            },

            ServerEvent::AgentStart { agent } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::AgentStarted(agent))]
            }
            ServerEvent::AgentEnd { agent } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::AgentEnded(agent))]
            }
            ServerEvent::Handoff { from, to } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::Handoff { from, to })]
            }
            ServerEvent::ToolStart { tool } => {
                // Tool invocations also get an informational log line in
                // the transcript itself.
                let name = tool.clone().unwrap_or_else(|| "unknown".to_string());
                vec![
                    ReconcilerUpdate::Status(StatusUpdate::ToolStarted(tool)),
                    ReconcilerUpdate::Message(Message::new(
                        Role::System,
                        format!("tool invoked: {name}"),
                    )),
                ]
            }
            ServerEvent::ToolEnd { tool, .. } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::ToolEnded(tool))]
            }
            ServerEvent::AudioEnd => vec![ReconcilerUpdate::Status(StatusUpdate::AudioDone)],
            ServerEvent::GuardrailTripped { message } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::GuardrailTripped(
                    message,
                ))]
            }
            ServerEvent::Error { error } => {
                vec![ReconcilerUpdate::Status(StatusUpdate::BackendError(error))]
            }
            ServerEvent::DebugText { text } => {
                debug!("backend debug text: {:?}", text);
                Vec::new()
            }
            ServerEvent::Unknown => Vec::new(),
        }
    }

    /// Full resync. The pre-extracted summary is authoritative for the
    /// same fact the history array carries, so it short-circuits the
    /// scan entirely.
    fn on_history_updated(
        &mut self,
        last_assistant_message: Option<String>,
        history: Vec<HistoryItem>,
    ) -> Vec<ReconcilerUpdate> {
        if let Some(text) = last_assistant_message.filter(|t| !t.trim().is_empty()) {
            return vec![ReconcilerUpdate::Message(Message::new(
                Role::Assistant,
                text,
            ))];
        }
        let mut updates = Vec::new();
        for item in history {
            if !item.item_id.is_empty() {
                if self.seen.contains(&item.item_id) {
                    continue;
                }
                self.seen.insert(item.item_id.clone());
            }
            if let Some(text) = extract_item_text(&item) {
                updates.push(ReconcilerUpdate::Message(Message::new(item.role, text)));
            }
        }
        updates
    }

    /// One new item; re-delivery of an already-seen id is a no-op.
    fn on_history_added(
        &mut self,
        item: Option<HistoryItem>,
        text: Option<String>,
    ) -> Vec<ReconcilerUpdate> {
        if let Some(item) = item {
            if !item.item_id.is_empty() {
                if self.seen.contains(&item.item_id) {
                    debug!("ignoring re-delivered history item {}", item.item_id);
                    return Vec::new();
                }
                self.seen.insert(item.item_id.clone());
            }
            return match extract_item_text(&item) {
                Some(text) => vec![ReconcilerUpdate::Message(Message::new(item.role, text))],
                None => Vec::new(),
            };
        }
        // Some deliveries carry only the backend's pre-extracted text.
        match text.filter(|t| !t.trim().is_empty()) {
            Some(text) => vec![ReconcilerUpdate::Message(Message::new(
                Role::Assistant,
                text,
            ))],
            None => Vec::new(),
        }
    }

    /// One-time backlog replay: every item surfaces, no id filtering.
    fn on_history_loaded(&mut self, history: Vec<HistoryItem>) -> Vec<ReconcilerUpdate> {
        let mut updates = Vec::new();
        for item in history {
            if !item.item_id.is_empty() {
                self.seen.insert(item.item_id.clone());
            }
            if let Some(text) = extract_item_text(&item) {
                updates.push(ReconcilerUpdate::Message(Message::new(item.role, text)));
            }
        }
        updates
    }

    fn on_delta(&mut self, delta: &str) -> Vec<ReconcilerUpdate> {
        self.pending.push_str(delta);
        vec![ReconcilerUpdate::Partial(self.pending.clone())]
    }

    /// Finalize the in-progress turn. The event's own transcript wins
    /// over the accumulated deltas; either way the partial is cleared.
    fn on_done(&mut self, transcript: Option<String>) -> Vec<ReconcilerUpdate> {
        let text = match transcript.filter(|t| !t.is_empty()) {
            Some(text) => {
                self.pending.clear();
                text
            }
            None => std::mem::take(&mut self.pending),
        };
        if text.trim().is_empty() {
            // Nothing to finalize.
            return Vec::new();
        }
        vec![ReconcilerUpdate::Message(Message::new(
            Role::Assistant,
            text,
        ))]
    }
}
