use std::sync::Mutex;

use croplive_core::analysis::extract_analysis;
use croplive_core::state::SessionState;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Point-in-time view of the session for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub transcript: String,
    pub analysis: Option<Value>,
    pub error: Option<String>,
}

/// Notifications pushed to the UI layer as the session progresses.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Full accumulated transcript after an append or clear.
    TranscriptUpdated(String),
    AnalysisUpdated(Value),
    TurnComplete { interrupted: bool },
    Warning(String),
    Error(String),
}

/// Session state shared between the manager and its event pump. All
/// mutation goes through these methods so transitions stay legal.
pub(crate) struct Shared {
    inner: Mutex<SharedInner>,
}

struct SharedInner {
    state: SessionState,
    transcript: String,
    analysis: Option<Value>,
    error: Option<String>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                state: SessionState::Disconnected,
                transcript: String::new(),
                analysis: None,
                error: None,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Apply a transition if it is legal; returns whether it happened.
    pub fn transition(&self, to: SessionState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.can_transition(to) {
            log::warn!(
                "refusing illegal transition {} -> {}",
                inner.state.label(),
                to.label()
            );
            return false;
        }
        inner.state = to;
        true
    }

    /// Append streamed text; returns the full transcript and a structured
    /// analysis if one became extractable.
    pub fn append_text(&self, text: &str) -> (String, Option<Value>) {
        let mut inner = self.inner.lock().unwrap();
        inner.transcript.push_str(text);
        let analysis = extract_analysis(&inner.transcript);
        if let Some(v) = analysis.clone() {
            inner.analysis = Some(v);
        }
        (inner.transcript.clone(), analysis)
    }

    pub fn clear_transcript(&self) {
        self.inner.lock().unwrap().transcript.clear();
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().error = Some(message.into());
    }

    /// Back to initial values: Disconnected, empty transcript, no analysis,
    /// no error.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::Disconnected;
        inner.transcript.clear();
        inner.analysis = None;
        inner.error = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().unwrap();
        SessionSnapshot {
            state: inner.state,
            transcript: inner.transcript.clone(),
            analysis: inner.analysis.clone(),
            error: inner.error.clone(),
        }
    }
}

/// Everything one `start_streaming` call acquired. All teardown paths
/// (stop, switch, disconnect, drop) release through here, so a torn-down
/// pipeline can't leave a timer or device handle behind.
pub(crate) struct StreamResources {
    pub frame_task: JoinHandle<()>,
    pub audio_task: JoinHandle<()>,
    pub guard: Option<Box<dyn std::any::Any + Send>>,
}

impl StreamResources {
    pub fn release(mut self) {
        self.frame_task.abort();
        self.audio_task.abort();
        drop(self.guard.take());
    }
}
