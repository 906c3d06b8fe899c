//! Seamless playback of inbound audio chunks.
//!
//! Chunk boundaries carry no meaning: decoded buffers play strictly in
//! enqueue order, back to back, by chaining — finishing buffer *n* is
//! what dequeues and starts buffer *n+1*. The FIFO and its {Idle,
//! Playing} state machine are a plain struct so the chaining discipline
//! is testable without a device; the device itself sits behind
//! [`PlaybackSink`] and is driven from a dedicated OS thread, since
//! PulseAudio writes block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;

use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{self, CHANNELS, SAMPLE_RATE};

/// Samples per chained write; small enough that a mute toggle lands on
/// the buffer currently playing (50 ms at 24 kHz).
const WRITE_BLOCK: usize = 1_200;

/// Where decoded samples actually go. `write` returns once the device
/// has accepted the block, which is what paces the chain.
pub trait PlaybackSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// The playback FIFO. Owned exclusively by the driver; enqueue and
/// buffer completion are the only mutations.
#[derive(Debug)]
pub struct PlaybackQueue {
    queue: VecDeque<Vec<i16>>,
    state: PlaybackState,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: PlaybackState::Idle,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a decoded buffer. When idle, playback starts immediately:
    /// the buffer is handed straight back to be played.
    pub fn enqueue(&mut self, buffer: Vec<i16>) -> Option<Vec<i16>> {
        match self.state {
            PlaybackState::Idle => {
                self.state = PlaybackState::Playing;
                Some(buffer)
            }
            PlaybackState::Playing => {
                self.queue.push_back(buffer);
                None
            }
        }
    }

    /// Buffer *n* finished: dequeue *n+1*, or go idle if the queue is
    /// empty. The next enqueue restarts playback.
    pub fn on_complete(&mut self) -> Option<Vec<i16>> {
        match self.queue.pop_front() {
            Some(next) => Some(next),
            None => {
                self.state = PlaybackState::Idle;
                None
            }
        }
    }

    /// Drop everything queued and go idle.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.state = PlaybackState::Idle;
    }
}

enum PlaybackCmd {
    Enqueue(Vec<u8>),
    Clear,
    Shutdown,
}

/// Handle to the playback driver. Cloneable; the queue itself lives on
/// the driver thread and is only reached through these commands.
#[derive(Clone)]
pub struct Playback {
    tx: Sender<PlaybackCmd>,
    muted: Arc<AtomicBool>,
}

impl Playback {
    /// Start a driver thread around an already-built sink.
    pub fn start(sink: Box<dyn PlaybackSink>) -> (Self, thread::JoinHandle<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let muted = Arc::new(AtomicBool::new(false));
        let muted_for_driver = muted.clone();
        let handle = thread::spawn(move || run_driver(rx, sink, muted_for_driver));
        (Self { tx, muted }, handle)
    }

    /// Open the default output device and start the driver on it.
    pub fn open_default(app_name: &str) -> Result<(Self, thread::JoinHandle<()>)> {
        let sink = PulseSink::new(app_name)?;
        Ok(Self::start(Box::new(sink)))
    }

    /// Hand one raw (base64-decoded) chunk to the driver.
    pub fn enqueue(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(PlaybackCmd::Enqueue(bytes));
    }

    /// Flush the queue and abandon whatever is playing.
    pub fn clear(&self) {
        let _ = self.tx.send(PlaybackCmd::Clear);
    }

    /// Gain control: 0 while muted, 1 otherwise. Takes effect on the
    /// buffer currently playing and never touches the queue.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Stop the driver and release the device, after playing out what
    /// is already queued. Combine with [`Playback::clear`] to stop
    /// immediately. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.tx.send(PlaybackCmd::Shutdown);
    }
}

enum Handled {
    Start(Vec<i16>),
    Nothing,
    Shutdown,
}

enum Step {
    Done,
    Abandoned,
    Shutdown,
}

fn run_driver(rx: Receiver<PlaybackCmd>, mut sink: Box<dyn PlaybackSink>, muted: Arc<AtomicBool>) {
    let mut queue = PlaybackQueue::new();
    debug!("playback driver started");
    'idle: loop {
        // Idle: block until a command arrives.
        let cmd = match rx.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };
        let mut current = match handle_cmd(cmd, &mut queue) {
            Handled::Start(buffer) => buffer,
            Handled::Nothing => continue,
            Handled::Shutdown => break,
        };
        // Playing: chain buffers until the queue drains.
        loop {
            match play_buffer(&current, sink.as_mut(), &rx, &mut queue, &muted) {
                Step::Done | Step::Abandoned => {}
                Step::Shutdown => {
                    // No more commands will be honored; play out what is
                    // already queued, then stop.
                    while let Some(next) = queue.on_complete() {
                        if write_out(&next, sink.as_mut(), &muted).is_err() {
                            break;
                        }
                    }
                    break 'idle;
                }
            }
            match queue.on_complete() {
                Some(next) => current = next,
                None => continue 'idle,
            }
        }
    }
    debug!("playback driver stopped");
    // Dropping the sink releases the output device.
}

fn handle_cmd(cmd: PlaybackCmd, queue: &mut PlaybackQueue) -> Handled {
    match cmd {
        PlaybackCmd::Enqueue(bytes) => match protocol::decode_pcm16(&bytes) {
            Ok(samples) => match queue.enqueue(samples) {
                Some(buffer) => Handled::Start(buffer),
                None => Handled::Nothing,
            },
            Err(e) => {
                // One undecodable chunk is dropped; playback continues.
                warn!("dropping undecodable audio chunk: {}", e);
                Handled::Nothing
            }
        },
        PlaybackCmd::Clear => {
            queue.clear();
            Handled::Nothing
        }
        PlaybackCmd::Shutdown => Handled::Shutdown,
    }
}

/// Play one buffer in chained sub-blocks, draining commands between
/// writes so enqueues land in the FIFO and clear/mute take effect while
/// this buffer is still audible. A shutdown seen here still finishes
/// the current buffer; the driver plays out the queue afterwards.
fn play_buffer(
    buffer: &[i16],
    sink: &mut dyn PlaybackSink,
    rx: &Receiver<PlaybackCmd>,
    queue: &mut PlaybackQueue,
    muted: &AtomicBool,
) -> Step {
    let mut shutdown = false;
    for block in buffer.chunks(WRITE_BLOCK) {
        while !shutdown {
            match rx.try_recv() {
                Ok(PlaybackCmd::Enqueue(bytes)) => match protocol::decode_pcm16(&bytes) {
                    // State is Playing, so this always queues.
                    Ok(samples) => {
                        queue.enqueue(samples);
                    }
                    Err(e) => warn!("dropping undecodable audio chunk: {}", e),
                },
                Ok(PlaybackCmd::Clear) => {
                    queue.clear();
                    return Step::Abandoned;
                }
                Ok(PlaybackCmd::Shutdown) | Err(TryRecvError::Disconnected) => shutdown = true,
                Err(TryRecvError::Empty) => break,
            }
        }
        let out: Vec<i16> = if muted.load(Ordering::Relaxed) {
            vec![0; block.len()]
        } else {
            block.to_vec()
        };
        if let Err(e) = sink.write(&out) {
            warn!("playback write failed, abandoning buffer: {}", e);
            return Step::Abandoned;
        }
    }
    if shutdown {
        Step::Shutdown
    } else {
        Step::Done
    }
}

/// Write one buffer with no command handling, used for the play-out
/// after a shutdown.
fn write_out(buffer: &[i16], sink: &mut dyn PlaybackSink, muted: &AtomicBool) -> Result<()> {
    for block in buffer.chunks(WRITE_BLOCK) {
        let out: Vec<i16> = if muted.load(Ordering::Relaxed) {
            vec![0; block.len()]
        } else {
            block.to_vec()
        };
        sink.write(&out)?;
    }
    Ok(())
}

/// PulseAudio output sink: mono PCM16 at the wire sample rate. Blocking
/// writes pace the chain for us.
pub struct PulseSink {
    simple: psimple::Simple,
}

impl PulseSink {
    pub fn new(app_name: &str) -> Result<Self> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: CHANNELS,
            rate: SAMPLE_RATE,
        };
        let simple = psimple::Simple::new(
            None,     // default server
            app_name, // application name
            pulse::stream::Direction::Playback,
            None,       // default device
            "playback", // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| SessionError::PermissionDenied(format!("{e}")))?;
        info!("audio output connected ({} Hz mono)", SAMPLE_RATE);
        Ok(Self { simple })
    }
}

impl PlaybackSink for PulseSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.simple
            .write(&bytes)
            .map_err(|e| SessionError::PermissionDenied(format!("{e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockSink {
        writes: Arc<Mutex<Vec<Vec<i16>>>>,
    }

    impl PlaybackSink for MockSink {
        fn write(&mut self, samples: &[i16]) -> Result<()> {
            self.writes.lock().unwrap().push(samples.to_vec());
            Ok(())
        }
    }

    impl MockSink {
        fn flattened(&self) -> Vec<i16> {
            self.writes.lock().unwrap().concat()
        }
    }

    fn chunk(sample: i16, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len * 2);
        for _ in 0..len {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn enqueue_on_idle_starts_immediately() {
        let mut queue = PlaybackQueue::new();
        assert_eq!(queue.state(), PlaybackState::Idle);
        let started = queue.enqueue(vec![1, 2, 3]);
        assert_eq!(started, Some(vec![1, 2, 3]));
        assert_eq!(queue.state(), PlaybackState::Playing);
        assert!(queue.is_empty());
    }

    #[test]
    fn completion_chaining_plays_in_enqueue_order() {
        let mut queue = PlaybackQueue::new();
        let a = queue.enqueue(vec![1]);
        assert_eq!(a, Some(vec![1]));
        assert_eq!(queue.enqueue(vec![2]), None);
        assert_eq!(queue.enqueue(vec![3]), None);
        // Completion of A dequeues B, completion of B dequeues C.
        assert_eq!(queue.on_complete(), Some(vec![2]));
        assert_eq!(queue.on_complete(), Some(vec![3]));
        // Empty queue halts playback until the next enqueue.
        assert_eq!(queue.on_complete(), None);
        assert_eq!(queue.state(), PlaybackState::Idle);
        assert_eq!(queue.enqueue(vec![4]), Some(vec![4]));
    }

    #[test]
    fn clear_drops_queue_and_goes_idle() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![1]);
        queue.enqueue(vec![2]);
        queue.clear();
        assert_eq!(queue.state(), PlaybackState::Idle);
        assert!(queue.is_empty());
    }

    #[test]
    fn driver_writes_chunks_in_enqueue_order() {
        let sink = MockSink::default();
        let (playback, handle) = Playback::start(Box::new(sink.clone()));
        playback.enqueue(chunk(1, 100));
        playback.enqueue(chunk(2, 100));
        playback.enqueue(chunk(3, 100));
        playback.shutdown();
        handle.join().unwrap();

        let flat = sink.flattened();
        assert_eq!(flat.len(), 300);
        assert!(flat[..100].iter().all(|&s| s == 1));
        assert!(flat[100..200].iter().all(|&s| s == 2));
        assert!(flat[200..].iter().all(|&s| s == 3));
    }

    #[test]
    fn mute_zeroes_output_without_dropping_or_reordering() {
        let sink = MockSink::default();
        let (playback, handle) = Playback::start(Box::new(sink.clone()));
        playback.set_muted(true);
        playback.enqueue(chunk(7, 50));
        playback.enqueue(chunk(9, 50));
        playback.shutdown();
        handle.join().unwrap();

        // Both buffers still played, at full length, just silent.
        let flat = sink.flattened();
        assert_eq!(flat.len(), 100);
        assert!(flat.iter().all(|&s| s == 0));
    }

    /// Flips the mute on from inside the first device write, i.e. while
    /// the first buffer is still playing.
    #[derive(Clone, Default)]
    struct MuteOnFirstWriteSink {
        writes: Arc<Mutex<Vec<Vec<i16>>>>,
        playback: Arc<Mutex<Option<Playback>>>,
    }

    impl PlaybackSink for MuteOnFirstWriteSink {
        fn write(&mut self, samples: &[i16]) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            writes.push(samples.to_vec());
            if writes.len() == 1 {
                if let Some(playback) = &*self.playback.lock().unwrap() {
                    playback.set_muted(true);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn mute_during_a_buffer_silences_its_remainder_and_queued_audio_still_plays() {
        let sink = MuteOnFirstWriteSink::default();
        let (playback, handle) = Playback::start(Box::new(sink.clone()));
        *sink.playback.lock().unwrap() = Some(playback.clone());

        // The first buffer spans three sub-blocks; the mute lands during
        // the first of them.
        playback.enqueue(chunk(7, WRITE_BLOCK * 3));
        playback.enqueue(chunk(9, WRITE_BLOCK));
        playback.shutdown();
        handle.join().unwrap();

        let writes = sink.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 4);
        assert!(writes[0].iter().all(|&s| s == 7));
        // The buffer's remaining sub-blocks go silent immediately, and
        // the queued buffer still plays at full length, also silent —
        // nothing is dropped, skipped, or reordered.
        for write in &writes[1..] {
            assert_eq!(write.len(), WRITE_BLOCK);
            assert!(write.iter().all(|&s| s == 0));
        }
    }

    #[test]
    fn undecodable_chunk_is_dropped_and_playback_continues() {
        let sink = MockSink::default();
        let (playback, handle) = Playback::start(Box::new(sink.clone()));
        playback.enqueue(vec![0x01]); // odd length
        playback.enqueue(chunk(5, 10));
        playback.shutdown();
        handle.join().unwrap();

        let flat = sink.flattened();
        assert_eq!(flat, vec![5; 10]);
    }

    #[test]
    fn clear_flushes_pending_buffers() {
        let sink = MockSink::default();
        let (playback, handle) = Playback::start(Box::new(sink.clone()));
        playback.clear();
        playback.enqueue(chunk(1, 10));
        playback.clear();
        playback.enqueue(chunk(2, 10));
        playback.shutdown();
        handle.join().unwrap();
        // Command order is preserved, so only the post-clear chunk is
        // guaranteed to have played in full; nothing after it vanished.
        let flat = sink.flattened();
        assert_eq!(&flat[flat.len() - 10..], &[2; 10]);
    }
}
