//! Microphone capture and PCM16 encoding.
//!
//! A dedicated OS thread owns the PulseAudio record stream (blocking
//! reads do not belong on the runtime). Each captured block of float
//! samples becomes exactly one wire frame, emitted to the session's
//! outbound channel unless the mic is muted — muted blocks are dropped
//! on the floor, never buffered for later. The device sits behind
//! [`CaptureSource`]; a failed read ends capture and is reported
//! through the failure callback so the session can surface the loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{self, ClientEvent, CHANNELS, SAMPLE_RATE};

/// Samples per capture block (100 ms at 24 kHz).
const CAPTURE_BLOCK: usize = 2_400;

/// Where captured bytes come from. `read` fills the whole buffer or
/// fails; a failure ends capture.
pub trait CaptureSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Handle to the capture thread. Dropping it stops capture.
pub struct CaptureHandle {
    shutdown: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    _thread: thread::JoinHandle<()>,
}

impl CaptureHandle {
    /// While muted, captured blocks are silently discarded; audio from
    /// the muted period is permanently lost, not deferred.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Ask the capture thread to exit after its current read.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Acquire the default input device and start the capture thread.
///
/// Acquisition happens up front so a missing microphone surfaces as a
/// recoverable [`SessionError::PermissionDenied`] instead of a dead
/// thread; the session then stays up for text-only interaction.
/// `on_failure` fires if the device dies later, mid-session.
pub fn spawn(
    app_name: &str,
    frames: UnboundedSender<ClientEvent>,
    on_failure: impl FnOnce(SessionError) + Send + 'static,
) -> Result<CaptureHandle> {
    let source = PulseSource::new(app_name)?;
    Ok(start(Box::new(source), frames, on_failure))
}

/// Start the capture thread around an already-built source.
pub fn start(
    source: Box<dyn CaptureSource>,
    frames: UnboundedSender<ClientEvent>,
    on_failure: impl FnOnce(SessionError) + Send + 'static,
) -> CaptureHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let muted = Arc::new(AtomicBool::new(false));
    let shutdown_for_thread = shutdown.clone();
    let muted_for_thread = muted.clone();
    let thread = thread::spawn(move || {
        if let Err(e) = capture_loop(source, &frames, &shutdown_for_thread, &muted_for_thread) {
            warn!("microphone capture failed: {}", e);
            on_failure(e);
        }
        debug!("microphone capture stopped");
        // Dropping the source releases the input device.
    });

    CaptureHandle {
        shutdown,
        muted,
        _thread: thread,
    }
}

fn capture_loop(
    mut source: Box<dyn CaptureSource>,
    frames: &UnboundedSender<ClientEvent>,
    shutdown: &AtomicBool,
    muted: &AtomicBool,
) -> Result<()> {
    let mut bytes = vec![0u8; CAPTURE_BLOCK * 4];
    while !shutdown.load(Ordering::Relaxed) {
        // A dead device fails every read immediately; stop instead of
        // spinning and let the caller report the loss.
        source.read(&mut bytes)?;
        if muted.load(Ordering::Relaxed) {
            continue;
        }
        let block: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let frame = protocol::encode_pcm16(&block);
        // Channel closed means the session is gone; stop capturing.
        if frames.send(ClientEvent::Audio { data: frame }).is_err() {
            break;
        }
    }
    Ok(())
}

/// PulseAudio record source: mono float at the wire sample rate.
pub struct PulseSource {
    simple: psimple::Simple,
}

impl PulseSource {
    pub fn new(app_name: &str) -> Result<Self> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::F32le,
            channels: CHANNELS,
            rate: SAMPLE_RATE,
        };
        let simple = psimple::Simple::new(
            None,     // default server
            app_name, // application name
            pulse::stream::Direction::Record,
            None,         // default device
            "microphone", // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| SessionError::PermissionDenied(format!("{e}")))?;
        info!("microphone capture connected ({} Hz mono)", SAMPLE_RATE);
        Ok(Self { simple })
    }
}

impl CaptureSource for PulseSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.simple
            .read(buf)
            .map_err(|e| SessionError::PermissionDenied(format!("{e}")))
    }
}
