use std::sync::Arc;
use std::time::Duration;

use croplive_core::config::LiveConfig;
use croplive_core::types::{
    CameraDevice, CameraFacing, CameraId, DeviceInventory, MicrophoneDevice, MicrophoneId,
};
use croplive_engine::engine::LiveSessionManager;
use croplive_engine::session::SessionEvent;
use croplive_engine::traits::{AudioSink, CapturePipeline, FrameGrabber, MediaSource};
use tokio::sync::mpsc;

// Placeholder frame used when CROP_FRAME is unset: a 1x1 grey JPEG.
const FALLBACK_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x10, 0x0B, 0x0C, 0x0E, 0x0C, 0x0A, 0x10, 0x0E,
    0x0D, 0x0E, 0x12, 0x11, 0x10, 0x13, 0x18, 0x28, 0x1A, 0x18, 0x16, 0x16, 0x18, 0x31, 0x23,
    0x25, 0x1D, 0x28, 0x3A, 0x33, 0x3D, 0x3C, 0x39, 0x33, 0x38, 0x37, 0x40, 0x48, 0x5C, 0x4E,
    0x40, 0x44, 0x57, 0x45, 0x37, 0x38, 0x50, 0x6D, 0x51, 0x57, 0x5F, 0x62, 0x67, 0x68, 0x67,
    0x3E, 0x4D, 0x71, 0x79, 0x70, 0x64, 0x78, 0x5C, 0x65, 0x67, 0x63, 0xFF, 0xC0, 0x00, 0x0B,
    0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0xFF, 0xC4, 0x00, 0x1F, 0x00, 0x00,
    0x01, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0xFF, 0xC4, 0x00,
    0x14, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00, 0x7F, 0xFF,
    0xD9,
];

struct FileFrames {
    jpeg: Vec<u8>,
}

impl FrameGrabber for FileFrames {
    fn grab(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(self.jpeg.clone())
    }
}

/// Synthetic capture stack: loops one JPEG as the camera and generates a
/// 440 Hz tone as the microphone so the gate and the audio path run
/// without real hardware.
struct SyntheticMedia {
    jpeg: Vec<u8>,
}

#[async_trait::async_trait]
impl MediaSource for SyntheticMedia {
    async fn list_devices(&self) -> anyhow::Result<DeviceInventory> {
        Ok(DeviceInventory {
            cameras: vec![CameraDevice {
                id: CameraId::new("synthetic-rear"),
                label: "synthetic rear camera".into(),
                facing: CameraFacing::Rear,
            }],
            microphones: vec![MicrophoneDevice {
                id: MicrophoneId::new("synthetic-mic"),
                label: "synthetic microphone".into(),
            }],
        })
    }

    async fn open(&self, _camera: Option<&CameraId>) -> anyhow::Result<CapturePipeline> {
        let (tx, rx) = mpsc::channel(16);
        let tone = tokio::spawn(async move {
            let mut phase = 0.0_f32;
            let step = 440.0 * std::f32::consts::TAU / 16_000.0;
            loop {
                let chunk: Vec<f32> = (0..4096)
                    .map(|_| {
                        phase = (phase + step) % std::f32::consts::TAU;
                        phase.sin() * 0.2
                    })
                    .collect();
                if tx.send(chunk).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(256)).await;
            }
        });

        struct StopTone(tokio::task::JoinHandle<()>);
        impl Drop for StopTone {
            fn drop(&mut self) {
                self.0.abort();
            }
        }

        Ok(CapturePipeline {
            frames: Box::new(FileFrames {
                jpeg: self.jpeg.clone(),
            }),
            audio: rx,
            guard: Some(Box::new(StopTone(tone))),
        })
    }
}

struct PrintSink;

impl AudioSink for PrintSink {
    fn play(&self, samples: Vec<f32>, rate_hz: u32) {
        println!("[audio] {} samples @ {} Hz", samples.len(), rate_hz);
    }
}

fn playback_sink() -> Arc<dyn AudioSink> {
    match croplive_audio::Speaker::open() {
        Ok(speaker) => Arc::new(speaker),
        Err(e) => {
            log::warn!("no playback device, printing audio instead: {e}");
            Arc::new(PrintSink)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        anyhow::bail!("set GEMINI_API_KEY to run the live session");
    }

    let mut cfg = LiveConfig::production(api_key);
    if let Ok(model) = std::env::var("GEMINI_MODEL") {
        cfg.model = model;
    }

    let jpeg = match std::env::var("CROP_FRAME") {
        Ok(path) => std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("read CROP_FRAME {path}: {e}"))?,
        Err(_) => FALLBACK_JPEG.to_vec(),
    };

    let run_secs: u64 = std::env::var("CROP_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let media = Arc::new(SyntheticMedia { jpeg });
    let (mut manager, mut events) =
        LiveSessionManager::new(cfg, media, playback_sink()).await;

    let printer = tokio::spawn(async move {
        while let Some(evt) = events.recv().await {
            match evt {
                SessionEvent::StateChanged(state) => println!("[state] {}", state.label()),
                SessionEvent::TranscriptUpdated(text) => {
                    if !text.is_empty() {
                        println!("[transcript] {text}");
                    }
                }
                SessionEvent::AnalysisUpdated(value) => println!("[analysis] {value}"),
                SessionEvent::TurnComplete { interrupted } => {
                    println!("[turn complete] interrupted={interrupted}")
                }
                SessionEvent::Warning(message) => println!("[warning] {message}"),
                SessionEvent::Error(message) => println!("[error] {message}"),
            }
        }
    });

    manager.connect(None).await?;
    manager.start_streaming(None).await?;
    println!("streaming for {run_secs}s, ctrl-c to stop");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(run_secs)) => {}
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
    }

    manager.disconnect().await;
    printer.abort();
    Ok(())
}
