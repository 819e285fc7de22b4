use crate::state::SessionState;

/// Session-level failure taxonomy.
///
/// Config and transport errors end the session; device errors leave it
/// connected with streaming off; decode errors are per-message and never
/// escalate past the message that failed.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("no API credential configured")]
    MissingCredential,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed unexpectedly ({code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    #[error("device access failed: {0}")]
    Device(String),

    #[error("failed to decode inbound payload: {0}")]
    Decode(String),

    #[error("illegal session transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("channel not open")]
    NotConnected,
}

impl LiveError {
    /// Whether the error leaves the session usable (Connected) or requires
    /// a manual reconnect.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            LiveError::MissingCredential
                | LiveError::Transport(_)
                | LiveError::AbnormalClose { .. }
        )
    }
}
