use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Message, protocol::frame::coding::CloseCode};
use url::Url;

use croplive_core::config::LiveConfig;
use croplive_core::error::LiveError;

use crate::wire::{
    MIME_PCM_INPUT, ServerMessage, ServerPart, build_media_chunk_message,
    build_prompted_frame_message, build_setup_message, build_text_turn_message,
    parse_server_message,
};

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const CTRL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Close code reported when the peer vanishes without a close frame.
const CLOSE_CODE_ABNORMAL: u16 = 1006;

fn should_warn_dropped_media(dropped: u64) -> bool {
    // Warn on the first drop, then periodically.
    dropped > 0 && (dropped == 1 || dropped % 50 == 0)
}

/// Events demultiplexed out of the live channel.
#[derive(Debug)]
pub enum LiveEvent {
    /// The remote side acknowledged the setup handshake. The session is
    /// usable only after this, never merely after the socket opened.
    Ready,
    Text {
        text: String,
    },
    /// Inline response audio, s16le at the configured output rate.
    Audio {
        pcm_s16le: Vec<u8>,
    },
    TurnComplete {
        interrupted: bool,
    },
    Warning {
        message: String,
    },
    Error {
        error: LiveError,
    },
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
}

#[derive(Debug)]
enum LiveCmd {
    PromptedFrame { jpeg: Vec<u8>, prompt: String },
    ContextFrame { jpeg: Vec<u8> },
    AudioChunk { pcm_s16le: Vec<u8> },
    TextTurn { text: String },
    Shutdown,
}

/// Cloneable command side of a live session.
#[derive(Clone)]
pub struct LiveHandle {
    tx: mpsc::Sender<LiveCmd>,
}

impl LiveHandle {
    /// Frame paired with the analysis prompt; forces a model turn.
    pub async fn send_prompted_frame(&self, jpeg: Vec<u8>, prompt: String) -> bool {
        self.tx
            .send(LiveCmd::PromptedFrame { jpeg, prompt })
            .await
            .is_ok()
    }

    /// Context-only frame. Dropped under backpressure rather than blocking.
    pub fn try_send_context_frame(&self, jpeg: Vec<u8>) -> bool {
        self.tx.try_send(LiveCmd::ContextFrame { jpeg }).is_ok()
    }

    /// Gated audio chunk. Dropped under backpressure rather than blocking.
    pub fn try_send_audio_chunk(&self, pcm_s16le: Vec<u8>) -> bool {
        self.tx.try_send(LiveCmd::AudioChunk { pcm_s16le }).is_ok()
    }

    pub async fn send_text_turn(&self, text: String) -> Result<(), LiveError> {
        self.tx
            .send(LiveCmd::TextTurn { text })
            .await
            .map_err(|_| LiveError::NotConnected)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(LiveCmd::Shutdown).await;
    }
}

fn build_live_url(cfg: &LiveConfig) -> anyhow::Result<Url> {
    let mut url = Url::parse(&cfg.endpoint).context("parse live endpoint")?;
    url.query_pairs_mut().append_pair("key", &cfg.api_key);
    Ok(url)
}

/// Open the live channel, send the setup handshake, and run the session
/// actor. Returns the command handle and the event receiver; `Ready` is
/// emitted once the remote side acknowledges setup.
pub async fn spawn_live_session(
    cfg: &LiveConfig,
) -> anyhow::Result<(LiveHandle, mpsc::Receiver<LiveEvent>)> {
    if !cfg.has_credential() {
        return Err(LiveError::MissingCredential.into());
    }

    let url = build_live_url(cfg)?;
    let req = url
        .as_str()
        .into_client_request()
        .context("build websocket request")?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<LiveCmd>(64);
    let (evt_tx, evt_rx) = mpsc::channel::<LiveEvent>(64);

    // Hard timeout so a bad network can't hang connect indefinitely.
    let (ws, _resp) =
        tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| LiveError::Transport("connect timed out".into()))?
            .context("connect live websocket")?;

    let (ws_write, mut ws_read) = ws.split();

    // Writer task: control messages (setup, prompted turns, pongs) go down a
    // separate lane so they can't be starved by media backlog.
    let (out_ctrl_tx, mut out_ctrl_rx) = mpsc::channel::<Message>(32);
    let (out_media_tx, mut out_media_rx) = mpsc::channel::<Message>(256);
    tokio::spawn(async move {
        let mut ws_write = ws_write;
        let mut ctrl_closed = false;
        let mut media_closed = false;

        loop {
            let next_msg: Option<Message> = tokio::select! {
                biased;
                msg = out_ctrl_rx.recv(), if !ctrl_closed => {
                    match msg {
                        Some(m) => Some(m),
                        None => { ctrl_closed = true; None }
                    }
                }
                msg = out_media_rx.recv(), if !media_closed => {
                    match msg {
                        Some(m) => Some(m),
                        None => { media_closed = true; None }
                    }
                }
            };

            let Some(msg) = next_msg else {
                if ctrl_closed && media_closed {
                    break;
                }
                continue;
            };

            let res = tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(msg)).await;
            if !matches!(res, Ok(Ok(()))) {
                break;
            }
        }

        let _ = ws_write.send(Message::Close(None)).await;
    });

    // The handshake is the first frame on the wire.
    let setup = build_setup_message(&cfg.model, &cfg.system_instruction);
    out_ctrl_tx
        .send(Message::Text(setup.into()))
        .await
        .map_err(|_| LiveError::Transport("websocket closed during setup".into()))?;

    tokio::spawn(async move {
        let mut ready = false;
        let mut dropped_media: u64 = 0;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    match cmd {
                        LiveCmd::PromptedFrame { jpeg, prompt } => {
                            let msg = build_prompted_frame_message(&jpeg, &prompt);
                            let sent = tokio::time::timeout(
                                CTRL_SEND_TIMEOUT,
                                out_ctrl_tx.send(Message::Text(msg.into())),
                            )
                            .await;
                            if !matches!(sent, Ok(Ok(()))) {
                                let _ = evt_tx.send(LiveEvent::Error {
                                    error: LiveError::Transport("websocket closed".into()),
                                }).await;
                                break;
                            }
                        }
                        LiveCmd::TextTurn { text } => {
                            let msg = build_text_turn_message(&text);
                            let sent = tokio::time::timeout(
                                CTRL_SEND_TIMEOUT,
                                out_ctrl_tx.send(Message::Text(msg.into())),
                            )
                            .await;
                            if !matches!(sent, Ok(Ok(()))) {
                                let _ = evt_tx.send(LiveEvent::Error {
                                    error: LiveError::Transport("websocket closed".into()),
                                }).await;
                                break;
                            }
                        }
                        LiveCmd::ContextFrame { jpeg } => {
                            let msg = build_media_chunk_message(crate::wire::MIME_JPEG, &jpeg);
                            if !try_send_media(&out_media_tx, msg, &mut dropped_media, &evt_tx) {
                                break;
                            }
                        }
                        LiveCmd::AudioChunk { pcm_s16le } => {
                            let msg = build_media_chunk_message(MIME_PCM_INPUT, &pcm_s16le);
                            if !try_send_media(&out_media_tx, msg, &mut dropped_media, &evt_tx) {
                                break;
                            }
                        }
                        LiveCmd::Shutdown => break,
                    }
                }

                msg = ws_read.next() => {
                    let Some(msg) = msg else {
                        let _ = evt_tx.send(LiveEvent::Closed {
                            code: CLOSE_CODE_ABNORMAL,
                            reason: "connection reset".into(),
                            clean: false,
                        }).await;
                        break;
                    };

                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            let _ = evt_tx.send(LiveEvent::Error {
                                error: LiveError::Transport(format!("websocket read failed: {e}")),
                            }).await;
                            break;
                        }
                    };

                    let text = match msg {
                        Message::Text(t) => t.to_string(),
                        Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                        Message::Close(frame) => {
                            let (code, reason) = match frame {
                                Some(f) => (u16::from(f.code), f.reason.to_string()),
                                None => (CLOSE_CODE_ABNORMAL, String::new()),
                            };
                            let clean = code == u16::from(CloseCode::Normal);
                            let _ = evt_tx.send(LiveEvent::Closed { code, reason, clean }).await;
                            break;
                        }
                        Message::Ping(p) => {
                            if out_ctrl_tx.try_send(Message::Pong(p)).is_err() {
                                let _ = evt_tx.send(LiveEvent::Error {
                                    error: LiveError::Transport("failed to send pong".into()),
                                }).await;
                                break;
                            }
                            continue;
                        }
                        Message::Pong(_) => continue,
                        _ => continue,
                    };

                    match parse_server_message(&text) {
                        Ok(ServerMessage::SetupComplete) => {
                            if !ready {
                                ready = true;
                                let _ = evt_tx.send(LiveEvent::Ready).await;
                            }
                        }
                        Ok(ServerMessage::Content { parts, turn_complete, interrupted }) => {
                            for part in parts {
                                match part {
                                    ServerPart::Text(text) => {
                                        let _ = evt_tx.send(LiveEvent::Text { text }).await;
                                    }
                                    ServerPart::InlineAudio { data, .. } => {
                                        let _ = evt_tx.send(LiveEvent::Audio { pcm_s16le: data }).await;
                                    }
                                }
                            }
                            if turn_complete || interrupted {
                                let _ = evt_tx.send(LiveEvent::TurnComplete { interrupted }).await;
                            }
                        }
                        Ok(ServerMessage::ToolCall(call)) => {
                            // Tool handling is out of scope for this session.
                            log::info!("ignoring tool call: {call}");
                        }
                        Err(e) => {
                            // Per-message decode failure: drop it, keep the session.
                            log::warn!("dropping undecodable server message: {e:#}");
                        }
                    }
                }
            }
        }

        // Dropping the outbound senders ends the writer task, which sends Close.
    });

    Ok((LiveHandle { tx: cmd_tx }, evt_rx))
}

fn try_send_media(
    out_media_tx: &mpsc::Sender<Message>,
    msg: String,
    dropped: &mut u64,
    evt_tx: &mpsc::Sender<LiveEvent>,
) -> bool {
    match out_media_tx.try_send(Message::Text(msg.into())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Best-effort: drop the chunk rather than stalling reads.
            *dropped = dropped.saturating_add(1);
            if should_warn_dropped_media(*dropped) {
                let _ = evt_tx.try_send(LiveEvent::Warning {
                    message: format!(
                        "live channel backpressure: dropped {dropped} media chunks"
                    ),
                });
            }
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            let _ = evt_tx.try_send(LiveEvent::Error {
                error: LiveError::Transport("websocket closed".into()),
            });
            false
        }
    }
}
