use std::sync::Arc;

use croplive_audio::{decode_s16le, encode_s16le, passes_noise_gate};
use croplive_core::config::LiveConfig;
use croplive_core::error::LiveError;
use croplive_core::state::SessionState;
use croplive_core::types::{CameraId, DeviceInventory};
use croplive_providers::live::{LiveEvent, LiveHandle, spawn_live_session};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cadence::{FrameCadence, FrameClass};
use crate::session::{SessionEvent, SessionSnapshot, Shared, StreamResources};
use crate::traits::{AudioSink, CapturePipeline, MediaSource};

/// The live media session manager.
///
/// Owns one streaming session to the multimodal endpoint: camera frames and
/// gated microphone audio multiplexed out, text and response audio
/// demultiplexed back in. At most one capture pipeline and one frame
/// producer exist at a time; every teardown path funnels through the same
/// release routine.
pub struct LiveSessionManager {
    cfg: LiveConfig,
    media: Arc<dyn MediaSource>,
    sink: Arc<dyn AudioSink>,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<SessionEvent>,
    devices: DeviceInventory,
    handle: Option<LiveHandle>,
    pump_task: Option<JoinHandle<()>>,
    streaming: Option<StreamResources>,
}

impl LiveSessionManager {
    /// Build the manager and enumerate capture devices.
    pub async fn new(
        cfg: LiveConfig,
        media: Arc<dyn MediaSource>,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let mut manager = Self {
            cfg,
            media,
            sink,
            shared: Arc::new(Shared::new()),
            events_tx,
            devices: DeviceInventory::default(),
            handle: None,
            pump_task: None,
            streaming: None,
        };
        manager.refresh_devices().await;
        (manager, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    pub fn devices(&self) -> &DeviceInventory {
        &self.devices
    }

    pub async fn refresh_devices(&mut self) -> &DeviceInventory {
        match self.media.list_devices().await {
            Ok(inventory) => self.devices = inventory,
            Err(e) => log::warn!("device enumeration failed: {e:#}"),
        }
        &self.devices
    }

    /// Open the channel, perform the setup handshake, and wait for the
    /// remote acknowledgement. Returns with the session Connected; on any
    /// failure the state is Disconnected and the error is recorded.
    pub async fn connect(&mut self, system_instruction: Option<&str>) -> Result<(), LiveError> {
        let from = self.shared.state();
        if from != SessionState::Disconnected {
            return Err(LiveError::IllegalTransition {
                from,
                to: SessionState::Connecting,
            });
        }
        if !self.cfg.has_credential() {
            let err = LiveError::MissingCredential;
            self.shared.record_error(err.to_string());
            return Err(err);
        }

        self.set_state(SessionState::Connecting).await;

        let mut cfg = self.cfg.clone();
        if let Some(instruction) = system_instruction {
            cfg.system_instruction = instruction.to_string();
        }

        let (handle, mut live_events) = match spawn_live_session(&cfg).await {
            Ok(v) => v,
            Err(e) => {
                let err = match e.downcast::<LiveError>() {
                    Ok(live) => live,
                    Err(other) => LiveError::Transport(format!("{other:#}")),
                };
                self.fail_connect(&err).await;
                return Err(err);
            }
        };

        // The session is usable only once the remote side acknowledges
        // setup, never merely because the socket opened.
        let outcome = tokio::time::timeout(cfg.connect_timeout, async {
            while let Some(evt) = live_events.recv().await {
                match evt {
                    LiveEvent::Ready => return Ok(()),
                    LiveEvent::Error { error } => return Err(error),
                    LiveEvent::Closed { code, reason, clean } => {
                        return Err(if clean {
                            LiveError::Transport("closed before setup completed".into())
                        } else {
                            LiveError::AbnormalClose { code, reason }
                        });
                    }
                    _ => {}
                }
            }
            Err(LiveError::Transport("channel ended before setup completed".into()))
        })
        .await;

        let acknowledged = match outcome {
            Ok(res) => res,
            Err(_elapsed) => {
                handle.shutdown().await;
                Err(LiveError::Transport("setup acknowledgement timed out".into()))
            }
        };
        if let Err(err) = acknowledged {
            self.fail_connect(&err).await;
            return Err(err);
        }

        self.pump_task = Some(spawn_event_pump(
            live_events,
            self.shared.clone(),
            self.sink.clone(),
            self.events_tx.clone(),
            self.cfg.output_sample_rate_hz,
        ));
        self.handle = Some(handle);
        self.set_state(SessionState::Connected).await;
        Ok(())
    }

    /// Acquire the camera+microphone and start the two producers: the 1 Hz
    /// frame cadence and the noise-gated audio forwarder. Restarts tear
    /// down the previous pipeline first.
    pub async fn start_streaming(&mut self, camera: Option<&CameraId>) -> Result<(), LiveError> {
        if self.shared.state() == SessionState::Streaming {
            self.stop_streaming().await;
        }

        let from = self.shared.state();
        if from != SessionState::Connected {
            return Err(LiveError::IllegalTransition {
                from,
                to: SessionState::Streaming,
            });
        }
        let handle = self.handle.clone().ok_or(LiveError::NotConnected)?;

        let chosen = match camera {
            Some(id) => id.clone(),
            None => match self.devices.default_camera() {
                Some(cam) => cam.id.clone(),
                None => {
                    let err = LiveError::Device("no camera devices available".into());
                    self.report_device_error(&err).await;
                    return Err(err);
                }
            },
        };

        let pipeline = match self.media.open(Some(&chosen)).await {
            Ok(p) => p,
            Err(e) => {
                let err = LiveError::Device(format!("{e:#}"));
                self.report_device_error(&err).await;
                return Err(err);
            }
        };
        let CapturePipeline {
            mut frames,
            mut audio,
            guard,
        } = pipeline;

        let frame_handle = handle.clone();
        let prompt = self.cfg.analysis_prompt.clone();
        let interval = self.cfg.frame_interval;
        let divisor = self.cfg.prompted_frame_divisor;
        let frame_task = tokio::spawn(async move {
            let mut cadence = FrameCadence::new(divisor);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let jpeg = match frames.grab() {
                    Ok(j) => j,
                    Err(e) => {
                        log::warn!("frame capture failed: {e:#}");
                        continue;
                    }
                };
                match cadence.next() {
                    FrameClass::Prompted => {
                        if !frame_handle.send_prompted_frame(jpeg, prompt.clone()).await {
                            break;
                        }
                    }
                    FrameClass::Context => {
                        if !frame_handle.try_send_context_frame(jpeg)
                            && !frame_handle.is_open()
                        {
                            break;
                        }
                    }
                }
            }
        });

        let audio_handle = handle;
        let threshold = self.cfg.noise_gate_threshold;
        let audio_task = tokio::spawn(async move {
            while let Some(chunk) = audio.recv().await {
                if !passes_noise_gate(&chunk, threshold) {
                    continue;
                }
                let pcm = encode_s16le(&chunk);
                if !audio_handle.try_send_audio_chunk(pcm) && !audio_handle.is_open() {
                    break;
                }
            }
        });

        self.streaming = Some(StreamResources {
            frame_task,
            audio_task,
            guard,
        });
        self.set_state(SessionState::Streaming).await;
        Ok(())
    }

    /// Stop the producers and release the capture pipeline. Idempotent.
    pub async fn stop_streaming(&mut self) {
        self.release_stream();
        if self.shared.state() == SessionState::Streaming {
            self.set_state(SessionState::Connected).await;
        }
    }

    /// Full teardown and restart against the new camera. Not a hot swap:
    /// the whole pipeline (audio included) is re-acquired.
    pub async fn switch_camera(&mut self, camera: &CameraId) -> Result<(), LiveError> {
        if self.shared.state() == SessionState::Streaming {
            self.stop_streaming().await;
        }
        self.refresh_devices().await;
        self.start_streaming(Some(camera)).await
    }

    /// Push a complete user text turn and clear the local transcript so
    /// the next response accumulates from empty.
    pub async fn send_message(&mut self, text: &str) -> Result<(), LiveError> {
        if !self.shared.state().is_connected() {
            return Err(LiveError::NotConnected);
        }
        let handle = self
            .handle
            .clone()
            .filter(|h| h.is_open())
            .ok_or(LiveError::NotConnected)?;

        handle.send_text_turn(text.to_string()).await?;
        self.shared.clear_transcript();
        let _ = self
            .events_tx
            .send(SessionEvent::TranscriptUpdated(String::new()))
            .await;
        Ok(())
    }

    /// Stop streaming, close the channel, stop the event pump, and reset
    /// all session state to initial values. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.release_stream();
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        // Stop the pump before resetting so no late decode can reach the
        // playback sink of a dead session.
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }
        self.shared.reset();
        let _ = self
            .events_tx
            .send(SessionEvent::StateChanged(SessionState::Disconnected))
            .await;
    }

    fn release_stream(&mut self) {
        if let Some(resources) = self.streaming.take() {
            resources.release();
        }
    }

    async fn set_state(&self, to: SessionState) {
        if self.shared.transition(to) {
            let _ = self.events_tx.send(SessionEvent::StateChanged(to)).await;
        }
    }

    async fn fail_connect(&self, err: &LiveError) {
        self.shared.record_error(err.to_string());
        self.set_state(SessionState::Disconnected).await;
        let _ = self
            .events_tx
            .send(SessionEvent::Error(err.to_string()))
            .await;
    }

    async fn report_device_error(&self, err: &LiveError) {
        // Device errors leave the session connected with streaming off.
        self.shared.record_error(err.to_string());
        let _ = self
            .events_tx
            .send(SessionEvent::Error(err.to_string()))
            .await;
    }
}

impl Drop for LiveSessionManager {
    fn drop(&mut self) {
        self.release_stream();
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }
    }
}

/// Consume demultiplexed channel events: accumulate transcript, extract
/// analysis, decode and play response audio, propagate errors and closes.
fn spawn_event_pump(
    mut live_events: mpsc::Receiver<LiveEvent>,
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    events_tx: mpsc::Sender<SessionEvent>,
    output_rate_hz: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(evt) = live_events.recv().await {
            match evt {
                LiveEvent::Ready => {}
                LiveEvent::Text { text } => {
                    let (full, analysis) = shared.append_text(&text);
                    let _ = events_tx.send(SessionEvent::TranscriptUpdated(full)).await;
                    if let Some(value) = analysis {
                        let _ = events_tx.send(SessionEvent::AnalysisUpdated(value)).await;
                    }
                }
                LiveEvent::Audio { pcm_s16le } => match decode_s16le(&pcm_s16le) {
                    Ok(samples) => sink.play(samples, output_rate_hz),
                    Err(e) => log::warn!("dropping undecodable audio part: {e}"),
                },
                LiveEvent::TurnComplete { interrupted } => {
                    let _ = events_tx
                        .send(SessionEvent::TurnComplete { interrupted })
                        .await;
                }
                LiveEvent::Warning { message } => {
                    let _ = events_tx.send(SessionEvent::Warning(message)).await;
                }
                LiveEvent::Error { error } => {
                    shared.record_error(error.to_string());
                    if error.is_fatal_to_session() && shared.transition(SessionState::Disconnected)
                    {
                        let _ = events_tx
                            .send(SessionEvent::StateChanged(SessionState::Disconnected))
                            .await;
                    }
                    let _ = events_tx.send(SessionEvent::Error(error.to_string())).await;
                }
                LiveEvent::Closed { code, reason, clean } => {
                    if !clean {
                        let err = LiveError::AbnormalClose { code, reason };
                        shared.record_error(err.to_string());
                        let _ = events_tx.send(SessionEvent::Error(err.to_string())).await;
                    }
                    if shared.transition(SessionState::Disconnected) {
                        let _ = events_tx
                            .send(SessionEvent::StateChanged(SessionState::Disconnected))
                            .await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FrameGrabber;
    use async_trait::async_trait;
    use croplive_core::types::{CameraDevice, CameraFacing, MicrophoneDevice, MicrophoneId};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    struct RecordingSink {
        played: Mutex<Vec<(Vec<f32>, u32)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
            })
        }
    }

    impl AudioSink for RecordingSink {
        fn play(&self, samples: Vec<f32>, rate_hz: u32) {
            self.played.lock().unwrap().push((samples, rate_hz));
        }
    }

    struct StaticFrames;

    impl FrameGrabber for StaticFrames {
        fn grab(&mut self) -> anyhow::Result<Vec<u8>> {
            Ok(b"\xff\xd8frame".to_vec())
        }
    }

    struct ReleaseFlag(Arc<AtomicBool>);

    impl Drop for ReleaseFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct MockMedia {
        cameras: Vec<CameraDevice>,
        fail_open: bool,
        opens: AtomicUsize,
        audio_tx: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
        release_flags: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl MockMedia {
        fn with_camera() -> Arc<Self> {
            Arc::new(Self {
                cameras: vec![CameraDevice {
                    id: CameraId::new("cam0"),
                    label: "rear camera".into(),
                    facing: CameraFacing::Rear,
                }],
                fail_open: false,
                opens: AtomicUsize::new(0),
                audio_tx: Mutex::new(None),
                release_flags: Mutex::new(Vec::new()),
            })
        }

        fn without_cameras() -> Arc<Self> {
            Arc::new(Self {
                cameras: vec![],
                fail_open: false,
                opens: AtomicUsize::new(0),
                audio_tx: Mutex::new(None),
                release_flags: Mutex::new(Vec::new()),
            })
        }

        fn audio_sender(&self) -> mpsc::Sender<Vec<f32>> {
            self.audio_tx.lock().unwrap().clone().unwrap()
        }

        fn release_flag(&self, index: usize) -> Arc<AtomicBool> {
            self.release_flags.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl MediaSource for MockMedia {
        async fn list_devices(&self) -> anyhow::Result<DeviceInventory> {
            Ok(DeviceInventory {
                cameras: self.cameras.clone(),
                microphones: vec![MicrophoneDevice {
                    id: MicrophoneId::new("mic0"),
                    label: "mic".into(),
                }],
            })
        }

        async fn open(&self, _camera: Option<&CameraId>) -> anyhow::Result<CapturePipeline> {
            if self.fail_open {
                anyhow::bail!("camera permission denied");
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(32);
            *self.audio_tx.lock().unwrap() = Some(tx);
            let flag = Arc::new(AtomicBool::new(false));
            self.release_flags.lock().unwrap().push(flag.clone());
            Ok(CapturePipeline {
                frames: Box::new(StaticFrames),
                audio: rx,
                guard: Some(Box::new(ReleaseFlag(flag))),
            })
        }
    }

    /// Mock endpoint: acknowledges setup, forwards every inbound text frame
    /// to `seen`, and writes anything pushed into `script` to the socket.
    async fn start_server() -> (SocketAddr, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(256);
        let (script_tx, mut script_rx) = mpsc::channel::<String>(32);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let _ = ws.next().await; // setup handshake
            let _ = ws
                .send(Message::Text(r#"{"setupComplete":true}"#.into()))
                .await;

            let mut script_open = true;
            loop {
                tokio::select! {
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(Message::Text(t))) => {
                                let _ = seen_tx.send(t.to_string()).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        }
                    }
                    out = script_rx.recv(), if script_open => {
                        match out {
                            Some(s) => { let _ = ws.send(Message::Text(s.into())).await; }
                            None => script_open = false,
                        }
                    }
                }
            }
        });

        (addr, seen_rx, script_tx)
    }

    fn test_config(addr: SocketAddr) -> LiveConfig {
        let mut cfg = LiveConfig::production("test-key");
        cfg.endpoint = format!("ws://{addr}/live");
        cfg.connect_timeout = Duration::from_secs(2);
        cfg.frame_interval = Duration::from_millis(20);
        cfg
    }

    async fn connected_manager(
        media: Arc<MockMedia>,
        addr: SocketAddr,
    ) -> (
        LiveSessionManager,
        mpsc::Receiver<SessionEvent>,
        Arc<RecordingSink>,
    ) {
        let sink = RecordingSink::new();
        let (mut manager, events) =
            LiveSessionManager::new(test_config(addr), media, sink.clone()).await;
        manager.connect(None).await.unwrap();
        (manager, events, sink)
    }

    async fn wait_until(mut f: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn connect_resolves_connected_after_setup_ack() {
        let (addr, _seen, _script) = start_server().await;
        let (manager, _events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;
        assert_eq!(manager.state(), SessionState::Connected);
        assert!(manager.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn connect_without_ack_times_out_and_stays_disconnected() {
        // Server accepts the socket but never acknowledges setup.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await; // setup
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut cfg = test_config(addr);
        cfg.connect_timeout = Duration::from_millis(200);
        let (mut manager, _events) =
            LiveSessionManager::new(cfg, MockMedia::with_camera(), RecordingSink::new()).await;

        let err = manager.connect(None).await.err().unwrap();
        assert!(matches!(err, LiveError::Transport(_)));
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(manager.snapshot().error.is_some());
    }

    #[tokio::test]
    async fn connect_without_credential_is_a_config_error() {
        let mut cfg = LiveConfig::production("");
        cfg.endpoint = "ws://127.0.0.1:9/live".into();
        let (mut manager, _events) =
            LiveSessionManager::new(cfg, MockMedia::with_camera(), RecordingSink::new()).await;

        let err = manager.connect(None).await.err().unwrap();
        assert!(matches!(err, LiveError::MissingCredential));
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_while_connected_is_illegal() {
        let (addr, _seen, _script) = start_server().await;
        let (mut manager, _events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;
        let err = manager.connect(None).await.err().unwrap();
        assert!(matches!(err, LiveError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn start_streaming_before_connect_is_illegal() {
        let cfg = LiveConfig::production("k");
        let (mut manager, _events) =
            LiveSessionManager::new(cfg, MockMedia::with_camera(), RecordingSink::new()).await;
        let err = manager.start_streaming(None).await.err().unwrap();
        assert!(matches!(err, LiveError::IllegalTransition { .. }));
        assert!(manager.streaming.is_none());
    }

    #[tokio::test]
    async fn start_streaming_with_no_cameras_is_a_device_error() {
        let (addr, _seen, _script) = start_server().await;
        let media = MockMedia::without_cameras();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;

        let err = manager.start_streaming(None).await.err().unwrap();
        assert!(matches!(err, LiveError::Device(_)));
        // Streaming stayed off: no producer, no pipeline acquisition, and
        // the session itself is still usable.
        assert!(manager.streaming.is_none());
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(media.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn device_open_failure_leaves_session_connected() {
        let (addr, _seen, _script) = start_server().await;
        let media = Arc::new(MockMedia {
            cameras: MockMedia::with_camera().cameras.clone(),
            fail_open: true,
            opens: AtomicUsize::new(0),
            audio_tx: Mutex::new(None),
            release_flags: Mutex::new(Vec::new()),
        });
        let (mut manager, _events, _sink) = connected_manager(media, addr).await;

        let err = manager.start_streaming(None).await.err().unwrap();
        assert!(matches!(err, LiveError::Device(_)));
        assert_eq!(manager.state(), SessionState::Connected);
        assert!(manager.streaming.is_none());
    }

    #[tokio::test]
    async fn frames_follow_the_one_in_three_cadence() {
        let (addr, mut seen, _script) = start_server().await;
        let (mut manager, _events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;
        manager.start_streaming(None).await.unwrap();
        assert_eq!(manager.state(), SessionState::Streaming);

        let mut frames = Vec::new();
        while frames.len() < 9 {
            let msg = tokio::time::timeout(Duration::from_secs(2), seen.recv())
                .await
                .expect("frame stream stalled")
                .unwrap();
            if msg.contains("image/jpeg") {
                frames.push(msg);
            }
        }
        manager.stop_streaming().await;

        for (i, frame) in frames.iter().enumerate() {
            let n = i + 1;
            if n % 3 == 0 {
                assert!(frame.contains("clientContent"), "frame {n} should be prompted");
                assert!(frame.contains("Analyze the crop health"));
            } else {
                assert!(frame.contains("realtimeInput"), "frame {n} should be context");
            }
        }
    }

    #[tokio::test]
    async fn silent_audio_chunks_never_reach_the_wire() {
        let (addr, mut seen, _script) = start_server().await;
        let media = MockMedia::with_camera();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;

        // Slow frames down so the wire traffic is dominated by audio.
        manager.cfg.frame_interval = Duration::from_secs(30);
        manager.start_streaming(None).await.unwrap();

        let audio_tx = media.audio_sender();
        let loud = vec![0.5_f32; 512];
        audio_tx.send(vec![0.0; 512]).await.unwrap(); // silence: gated
        audio_tx.send(vec![0.005; 512]).await.unwrap(); // below threshold: gated
        audio_tx.send(loud.clone()).await.unwrap();

        let audio_msg = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = seen.recv().await.unwrap();
                if msg.contains("audio/pcm;rate=16000") {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        manager.stop_streaming().await;

        // The one chunk that made it is the loud one, bytes intact.
        let v: serde_json::Value = serde_json::from_str(&audio_msg).unwrap();
        let b64 = v["realtimeInput"]["mediaChunks"][0]["data"].as_str().unwrap();
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        assert_eq!(bytes, encode_s16le(&loud));

        // And nothing else audio-shaped arrived.
        while let Ok(msg) = seen.try_recv() {
            assert!(!msg.contains("audio/pcm"), "gated chunk leaked: {msg}");
        }
    }

    #[tokio::test]
    async fn stop_streaming_twice_is_idempotent() {
        let (addr, _seen, _script) = start_server().await;
        let media = MockMedia::with_camera();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;
        manager.start_streaming(None).await.unwrap();

        manager.stop_streaming().await;
        let first = manager.snapshot();
        assert_eq!(first.state, SessionState::Connected);
        assert!(media.release_flag(0).load(Ordering::SeqCst));

        manager.stop_streaming().await;
        assert_eq!(manager.snapshot(), first);
    }

    #[tokio::test]
    async fn restarting_streaming_releases_the_previous_pipeline() {
        let (addr, _seen, _script) = start_server().await;
        let media = MockMedia::with_camera();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;

        manager.start_streaming(None).await.unwrap();
        manager.start_streaming(None).await.unwrap();

        assert_eq!(manager.state(), SessionState::Streaming);
        assert_eq!(media.opens.load(Ordering::SeqCst), 2);
        assert!(media.release_flag(0).load(Ordering::SeqCst));
        assert!(!media.release_flag(1).load(Ordering::SeqCst));
        manager.stop_streaming().await;
    }

    #[tokio::test]
    async fn switch_camera_restarts_against_the_new_device() {
        let (addr, _seen, _script) = start_server().await;
        let media = MockMedia::with_camera();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;

        manager.start_streaming(None).await.unwrap();
        manager
            .switch_camera(&CameraId::new("cam0"))
            .await
            .unwrap();

        assert_eq!(manager.state(), SessionState::Streaming);
        assert_eq!(media.opens.load(Ordering::SeqCst), 2);
        assert!(media.release_flag(0).load(Ordering::SeqCst));
        manager.stop_streaming().await;
    }

    #[tokio::test]
    async fn transcript_accumulates_across_turns() {
        let (addr, _seen, script) = start_server().await;
        let (manager, mut events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;

        script
            .send(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"A"},{"text":"B"}]}}}"#.into())
            .await
            .unwrap();
        script
            .send(
                r#"{"serverContent":{"modelTurn":{"parts":[{"text":"C"}]},"turnComplete":true}}"#
                    .into(),
            )
            .await
            .unwrap();

        let full = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::TranscriptUpdated(t)) = events.recv().await {
                    if t == "ABC" {
                        return t;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(full, "ABC");
        assert_eq!(manager.snapshot().transcript, "ABC");
    }

    #[tokio::test]
    async fn analysis_is_extracted_from_streamed_text() {
        let (addr, _seen, script) = start_server().await;
        let (manager, mut events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;

        script
            .send(
                r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Findings: {\"disease\":\"leaf rust\"}"}]}}}"#.into(),
            )
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::AnalysisUpdated(v)) = events.recv().await {
                    return v;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value["disease"], "leaf rust");
        assert_eq!(manager.snapshot().analysis.unwrap()["disease"], "leaf rust");
    }

    #[tokio::test]
    async fn response_audio_is_decoded_and_played() {
        let (addr, _seen, script) = start_server().await;
        let (manager, _events, sink) = connected_manager(MockMedia::with_camera(), addr).await;

        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD.encode([0x00, 0x01, 0xFF, 0x7F]);
        script
            .send(format!(
                r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm","data":"{b64}"}}}}]}}}}}}"#
            ))
            .await
            .unwrap();

        wait_until(|| !sink.played.lock().unwrap().is_empty(), "audio playback").await;
        let played = sink.played.lock().unwrap();
        let (samples, rate) = &played[0];
        assert_eq!(*rate, 24_000);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 256.0 / 32767.0).abs() < 1e-6);
        assert!((samples[1] - 1.0).abs() < 1e-6);
        drop(played);
        let _ = manager;
    }

    #[tokio::test]
    async fn send_message_ships_the_turn_and_clears_the_transcript() {
        let (addr, mut seen, script) = start_server().await;
        let (mut manager, _events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;

        script
            .send(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hello"}]}}}"#.into())
            .await
            .unwrap();
        wait_until(|| manager.snapshot().transcript == "hello", "transcript").await;

        manager.send_message("is this blight?").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("is this blight?"));
        assert!(msg.contains("\"turnComplete\":true"));
        assert!(manager.snapshot().transcript.is_empty());
    }

    #[tokio::test]
    async fn send_message_while_disconnected_errors() {
        let cfg = LiveConfig::production("k");
        let (mut manager, _events) =
            LiveSessionManager::new(cfg, MockMedia::with_camera(), RecordingSink::new()).await;
        let err = manager.send_message("hi").await.err().unwrap();
        assert!(matches!(err, LiveError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_resets_everything() {
        let (addr, _seen, script) = start_server().await;
        let media = MockMedia::with_camera();
        let (mut manager, _events, _sink) = connected_manager(media.clone(), addr).await;
        manager.start_streaming(None).await.unwrap();

        script
            .send(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hello"}]}}}"#.into())
            .await
            .unwrap();
        wait_until(|| manager.snapshot().transcript == "hello", "transcript").await;

        manager.disconnect().await;

        assert_eq!(
            manager.snapshot(),
            SessionSnapshot {
                state: SessionState::Disconnected,
                transcript: String::new(),
                analysis: None,
                error: None,
            }
        );
        assert!(media.release_flag(0).load(Ordering::SeqCst));

        // Teardown is repeatable.
        manager.disconnect().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn abnormal_close_surfaces_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await; // setup
            let _ = ws
                .send(Message::Text(r#"{"setupComplete":true}"#.into()))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "backend failure".into(),
                }))
                .await;
        });

        let (manager, mut events, _sink) = connected_manager(MockMedia::with_camera(), addr).await;

        let error = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::Error(e)) = events.recv().await {
                    return e;
                }
            }
        })
        .await
        .unwrap();
        assert!(error.contains("1011"));
        assert!(error.contains("backend failure"));

        wait_until(|| manager.state() == SessionState::Disconnected, "disconnect").await;
        assert!(manager.snapshot().error.is_some());
    }
}
