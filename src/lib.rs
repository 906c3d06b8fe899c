//! talkwire - realtime duplex voice client for the agents backend.
//!
//! One persistent WebSocket carries live speech and text in both
//! directions: microphone blocks are encoded as PCM16 frames and sent
//! as they are captured, inbound speech chunks play back seamlessly in
//! arrival order, and the heterogeneous stream of conversation events
//! is reconciled into a single deduplicated transcript.

/// Microphone capture and PCM16 encoding.
pub mod capture;
/// Session configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Gapless FIFO playback of inbound audio.
pub mod playback;
/// Wire events and PCM conversion.
pub mod protocol;
/// Event stream to message log reconciliation.
pub mod reconciler;
/// Connection lifecycle and routing.
pub mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use protocol::{ClientEvent, Role, ServerEvent};
pub use reconciler::{Message, Reconciler, ReconcilerUpdate, StatusUpdate};
pub use session::{Session, SessionEvent};
