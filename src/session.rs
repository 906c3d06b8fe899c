//! Connection session: owns the duplex channel and composes capture,
//! playback, and the reconciler.
//!
//! The session holds no transcript logic of its own — it routes and it
//! manages lifecycle. All outbound traffic funnels through one writer
//! task (the single point where events are serialized to JSON); all
//! inbound traffic goes through one dispatch task, which hands audio
//! chunks to playback and every other event to the reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureHandle};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::playback::Playback;
use crate::protocol::{self, ClientEvent, ServerEvent};
use crate::reconciler::{Message, Reconciler, ReconcilerUpdate, StatusUpdate};

/// Updates surfaced to whatever is rendering the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A finalized transcript message.
    Message(Message),
    /// The in-progress assistant turn so far.
    Partial(String),
    /// A status/control change.
    Status(StatusUpdate),
    /// Capture could not start, or the device died mid-session; the
    /// session stays up for text only.
    MicUnavailable(String),
    /// The output device could not be opened; audio chunks are dropped.
    SpeakerUnavailable(String),
    /// The channel closed, by the server or by a transport error.
    Disconnected,
}

/// One live connection to the realtime backend.
pub struct Session {
    outbound: Option<UnboundedSender<ClientEvent>>,
    connected: Arc<AtomicBool>,
    capture: Option<CaptureHandle>,
    playback: Option<Playback>,
    _playback_thread: Option<std::thread::JoinHandle<()>>,
    _writer_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl Session {
    /// Open the duplex channel, then bring up playback and capture.
    ///
    /// A channel that fails to open is an error; an audio device that
    /// fails to open is not — the failure is surfaced as a session
    /// event and the connection stays usable for text.
    pub async fn connect(
        config: SessionConfig,
    ) -> Result<(Self, UnboundedReceiver<SessionEvent>)> {
        info!("connecting to {}", config.url);
        let (ws, _response) = connect_async(&config.url).await?;
        let (mut sink, mut stream) = ws.split();
        info!("connected");

        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();

        // Writer: the single place outbound events become JSON. Ends
        // when every sender is gone, closing the socket behind it.
        let writer_connected = connected.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize outbound event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    warn!("websocket send failed: {}", e);
                    break;
                }
            }
            writer_connected.store(false, Ordering::Relaxed);
            let _ = sink.close().await;
            debug!("writer task finished");
        });

        let (playback, playback_thread) = if config.enable_playback {
            match Playback::open_default(&config.app_name) {
                Ok((playback, thread)) => (Some(playback), Some(thread)),
                Err(e) => {
                    warn!("audio output unavailable: {}", e);
                    let _ = events_tx.send(SessionEvent::SpeakerUnavailable(e.to_string()));
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let capture = if config.enable_capture {
            // A device lost mid-session surfaces the same way as one
            // that never opened.
            let capture_events = events_tx.clone();
            let on_failure = move |e: crate::error::SessionError| {
                let _ = capture_events.send(SessionEvent::MicUnavailable(e.to_string()));
            };
            match capture::spawn(&config.app_name, out_tx.clone(), on_failure) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("microphone unavailable, continuing text-only: {}", e);
                    let _ = events_tx.send(SessionEvent::MicUnavailable(e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        // Dispatch: one serial context for everything inbound. The
        // reconciler (and its seen-id set) lives and dies here.
        let dispatch_connected = connected.clone();
        let playback_for_dispatch = playback.clone();
        let dispatch_task = tokio::spawn(async move {
            let mut reconciler = Reconciler::new();
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => dispatch_text(
                        &text,
                        &mut reconciler,
                        playback_for_dispatch.as_ref(),
                        &events_tx,
                    ),
                    Ok(WsMessage::Close(frame)) => {
                        info!("server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {} // ping/pong/binary
                    Err(e) => {
                        warn!("websocket error: {}", e);
                        break;
                    }
                }
            }
            dispatch_connected.store(false, Ordering::Relaxed);
            reconciler.reset();
            let _ = events_tx.send(SessionEvent::Disconnected);
            debug!("dispatch task finished");
        });

        Ok((
            Self {
                outbound: Some(out_tx),
                connected,
                capture,
                playback,
                _playback_thread: playback_thread,
                _writer_task: writer_task,
                dispatch_task,
            },
            events_rx,
        ))
    }

    /// Send a typed utterance. A no-op once the channel is closed.
    pub fn send_text(&self, text: impl Into<String>) {
        if !self.connected.load(Ordering::Relaxed) {
            debug!("send_text ignored: channel closed");
            return;
        }
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(ClientEvent::Text { text: text.into() });
        }
    }

    /// Barge in: tell the backend to stop the current response and
    /// flush whatever speech is still queued locally.
    pub fn interrupt(&self) {
        if self.connected.load(Ordering::Relaxed) {
            if let Some(outbound) = &self.outbound {
                let _ = outbound.send(ClientEvent::Interrupt);
            }
        }
        if let Some(playback) = &self.playback {
            playback.clear();
        }
    }

    /// Mute or unmute the microphone. Muted capture blocks are lost.
    pub fn set_mic_muted(&self, muted: bool) {
        if let Some(capture) = &self.capture {
            capture.set_muted(muted);
        }
    }

    /// Mute or unmute playback, effective on the current buffer.
    pub fn set_playback_muted(&self, muted: bool) {
        if let Some(playback) = &self.playback {
            playback.set_muted(muted);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Ordered, best-effort teardown: stop capture, close playback,
    /// release device handles, close the channel. Every step runs even
    /// if an earlier one failed; calling this again is a no-op.
    pub async fn disconnect(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("disconnecting");
        } else {
            debug!("disconnect: already closed");
        }
        // 1. Stop capture; its thread exits after the current read and
        //    releases the input device.
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        // 2+3. Close playback; the clear abandons any in-flight buffer
        //    so the shutdown has nothing to play out, and the driver
        //    releases the output device on exit.
        if let Some(playback) = self.playback.take() {
            playback.clear();
            playback.shutdown();
        }
        // 4. Close the channel: dropping the last outbound sender ends
        //    the writer task, which closes the socket; the dispatch
        //    task is cut loose rather than awaited.
        self.outbound.take();
        self.dispatch_task.abort();
    }
}

/// Parse and route one inbound message. Malformed payloads are logged
/// and dropped; they never take the session down.
fn dispatch_text(
    text: &str,
    reconciler: &mut Reconciler,
    playback: Option<&Playback>,
    events: &UnboundedSender<SessionEvent>,
) {
    let event = match protocol::parse_server_event(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("dropping malformed message: {}", e);
            return;
        }
    };
    match event {
        ServerEvent::Audio { audio, .. } => {
            let bytes = match protocol::decode_audio_envelope(&audio) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("dropping audio chunk: {}", e);
                    return;
                }
            };
            if let Some(playback) = playback {
                playback.enqueue(bytes);
            }
        }
        ServerEvent::AudioInterrupted => {
            debug!("backend interrupted its own audio, flushing playback");
            if let Some(playback) = playback {
                playback.clear();
            }
        }
        other => {
            for update in reconciler.apply(other) {
                let event = match update {
                    ReconcilerUpdate::Message(message) => SessionEvent::Message(message),
                    ReconcilerUpdate::Partial(text) => SessionEvent::Partial(text),
                    ReconcilerUpdate::Status(status) => SessionEvent::Status(status),
                };
                if events.send(event).is_err() {
                    // Nobody is listening anymore; keep draining the
                    // socket anyway so teardown stays orderly.
                    break;
                }
            }
        }
    }
}
