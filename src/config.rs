//! Session configuration.

/// Default backend endpoint, matching the realtime proxy's route.
pub const DEFAULT_URL: &str = "ws://localhost:8000/ws/realtime";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the realtime backend.
    pub url: String,
    /// Application name reported to the sound server.
    pub app_name: String,
    /// Capture the microphone. Disabled sessions are text-only on the
    /// outbound side.
    pub enable_capture: bool,
    /// Play inbound speech audio. Disabled sessions drop audio chunks.
    pub enable_playback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            app_name: "talkwire".to_string(),
            enable_capture: true,
            enable_playback: true,
        }
    }
}

impl SessionConfig {
    /// Build a config from the environment, falling back to defaults.
    /// `TALKWIRE_WS_URL` overrides the endpoint.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TALKWIRE_WS_URL") {
            if !url.is_empty() {
                config.url = url;
            }
        }
        config
    }
}
