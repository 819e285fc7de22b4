use serde::{Deserialize, Serialize};

/// Session lifecycle as a single tagged state.
///
/// The source of truth for what the session is doing. Streaming implies a
/// live channel, so the only way in is through Connected and the only ways
/// out are back to Connected (stop) or Disconnected (error/disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Streaming)
    }

    pub fn is_streaming(self) -> bool {
        self == SessionState::Streaming
    }

    /// Legal transitions. Anything may drop to Disconnected (transport
    /// errors arrive in any state); everything else is a strict ladder.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Streaming) => true,
            (Streaming, Connected) => true,
            _ => false,
        }
    }

    /// Stable label for UI/log display.
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
        }
    }
}
