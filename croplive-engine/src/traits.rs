use async_trait::async_trait;
use croplive_core::types::{CameraId, DeviceInventory};
use tokio::sync::mpsc;

/// One camera+microphone acquisition.
///
/// `guard` keeps platform device handles alive for the lifetime of the
/// pipeline; releasing the pipeline drops it and stops all tracks.
pub struct CapturePipeline {
    pub frames: Box<dyn FrameGrabber>,
    /// Mono f32 chunks at the session's input rate, bounded upstream.
    pub audio: mpsc::Receiver<Vec<f32>>,
    pub guard: Option<Box<dyn std::any::Any + Send>>,
}

/// Grabs and JPEG-encodes the current camera frame.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// Capture hardware seam. The production implementation talks to real
/// devices; tests script inventories and frames.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn list_devices(&self) -> anyhow::Result<DeviceInventory>;

    /// Acquire the given camera (or the source's default) plus the
    /// microphone. Errors here are device errors: permission denied,
    /// missing hardware, busy devices.
    async fn open(&self, camera: Option<&CameraId>) -> anyhow::Result<CapturePipeline>;
}

/// Playback seam for decoded response audio.
pub trait AudioSink: Send + Sync {
    fn play(&self, samples: Vec<f32>, rate_hz: u32);
}

impl AudioSink for croplive_audio::Speaker {
    fn play(&self, samples: Vec<f32>, rate_hz: u32) {
        croplive_audio::Speaker::play(self, samples, rate_hz);
    }
}
