//
// CPAL microphone capture for the live session.
//
// The device opens at its default config; samples are mixed down to mono,
// chunked into fixed-size blocks at the target rate, and pushed into a
// bounded queue. The session's audio producer drains that queue; when it
// falls behind, chunks are dropped here rather than letting the audio
// callback stall.

use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, SizedSample, Stream};

use crate::resample::{input_len_for, resample_mono};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no input device found")]
    NoInputDevice,

    #[error("failed to list input devices: {0}")]
    ListDevices(#[from] cpal::DevicesError),

    #[error("failed to get default config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to play stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("audio worker failed: {0}")]
    Worker(String),

    #[error("audio worker startup timeout")]
    WorkerTimeout,

    #[error("internal channel error")]
    Channel,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Exact device name to open; `None` means the host default.
    pub device_name: Option<String>,
    /// Rate the remote service accepts (16 kHz).
    pub target_sample_rate_hz: u32,
    /// Samples per emitted chunk at the target rate.
    pub chunk_samples: usize,
    /// Bounded queue depth between the audio thread and the consumer.
    pub queue_depth: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            target_sample_rate_hz: 16_000,
            chunk_samples: 4096,
            queue_depth: 32,
        }
    }
}

/// Live microphone capture. Dropping (or calling `close`) stops the stream
/// and ends the chunk receiver.
pub struct MicCapture {
    cmd_tx: mpsc::Sender<Cmd>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

enum Cmd {
    Shutdown,
}

enum WorkerMsg {
    Ready,
    Error(String),
}

pub fn list_input_device_names() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let mut out = Vec::new();
    for dev in host.input_devices()? {
        if let Ok(name) = dev.name() {
            out.push(name);
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

impl MicCapture {
    /// Open the microphone and start streaming chunks immediately.
    ///
    /// Returns the capture handle and the bounded chunk receiver. Chunks are
    /// mono f32 at `cfg.target_sample_rate_hz`, `cfg.chunk_samples` long.
    pub fn open(
        cfg: CaptureConfig,
    ) -> Result<(Self, tokio::sync::mpsc::Receiver<Vec<f32>>), CaptureError> {
        let host = cpal::default_host();

        let device = match cfg.device_name.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let mut found = None;
                for dev in host.input_devices()? {
                    if dev.name().is_ok_and(|n| n == needle) {
                        found = Some(dev);
                        break;
                    }
                }
                match found {
                    Some(dev) => dev,
                    None => {
                        log::warn!("preferred input device not found, using default: {needle}");
                        host.default_input_device()
                            .ok_or(CaptureError::NoInputDevice)?
                    }
                }
            }
            _ => host
                .default_input_device()
                .ok_or(CaptureError::NoInputDevice)?,
        };

        let default_cfg = device.default_input_config()?;
        let device_rate_hz = default_cfg.sample_rate().0;

        let (sample_tx, sample_rx) = mpsc::channel::<Vec<f32>>();
        let (cmd_tx, cmd_rx) = mpsc::channel::<Cmd>();
        let (worker_tx, worker_rx) = mpsc::channel::<WorkerMsg>();
        let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel::<Vec<f32>>(cfg.queue_depth);

        let worker_handle = std::thread::spawn(move || {
            let config = default_cfg;
            let sample_format = config.sample_format();
            let channels = config.channels() as usize;

            let stream = match sample_format {
                SampleFormat::F32 => {
                    build_input_stream::<f32>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::I16 => {
                    build_input_stream::<i16>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::U16 => {
                    build_input_stream::<u16>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::I8 => {
                    build_input_stream::<i8>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::U8 => {
                    build_input_stream::<u8>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::I32 => {
                    build_input_stream::<i32>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::U32 => {
                    build_input_stream::<u32>(&device, &config.clone().into(), channels, sample_tx)
                }
                SampleFormat::F64 => {
                    build_input_stream::<f64>(&device, &config.clone().into(), channels, sample_tx)
                }
                _ => build_input_stream::<f32>(&device, &config.clone().into(), channels, sample_tx),
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = worker_tx.send(WorkerMsg::Error(format!("build stream: {e}")));
                    log::error!("audio input stream build failed: {e}");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = worker_tx.send(WorkerMsg::Error(format!("play stream: {e}")));
                log::error!("audio input stream play failed: {e}");
                return;
            }

            let _ = worker_tx.send(WorkerMsg::Ready);

            run_chunker(
                sample_rx,
                cmd_rx,
                chunk_tx,
                device_rate_hz,
                cfg.target_sample_rate_hz,
                cfg.chunk_samples,
            );
            drop(stream);
        });

        // Block briefly until the worker has either started the stream or failed.
        match worker_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(WorkerMsg::Ready) => {}
            Ok(WorkerMsg::Error(e)) => return Err(CaptureError::Worker(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(CaptureError::WorkerTimeout),
            Err(_) => return Err(CaptureError::Channel),
        }

        Ok((
            Self {
                cmd_tx,
                worker_handle: Some(worker_handle),
            },
            chunk_rx,
        ))
    }

    pub fn close(mut self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
        if let Some(h) = self.worker_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
        if let Some(h) = self.worker_handle.take() {
            let _ = h.join();
        }
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    channels: usize,
    sample_tx: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let cb = move |data: &[T], _: &cpal::InputCallbackInfo| {
        let mut buf = Vec::with_capacity(data.len() / channels.max(1));

        if channels == 1 {
            buf.extend(data.iter().map(|&s| s.to_sample::<f32>()));
        } else {
            for frame in data.chunks_exact(channels) {
                let mono =
                    frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / channels as f32;
                buf.push(mono);
            }
        }

        let _ = sample_tx.send(buf);
    };

    device.build_input_stream(
        config,
        cb,
        |err| {
            log::error!("audio input stream error: {err}");
        },
        None,
    )
}

fn should_emit_drop_warning(dropped: u64) -> bool {
    // Warn on the first drop, then periodically.
    dropped > 0 && (dropped == 1 || dropped % 50 == 0)
}

fn run_chunker(
    sample_rx: mpsc::Receiver<Vec<f32>>,
    cmd_rx: mpsc::Receiver<Cmd>,
    chunk_tx: tokio::sync::mpsc::Sender<Vec<f32>>,
    device_rate_hz: u32,
    target_rate_hz: u32,
    chunk_samples: usize,
) {
    let need = input_len_for(chunk_samples, device_rate_hz, target_rate_hz);
    let mut pending: Vec<f32> = Vec::with_capacity(need * 2);
    let mut dropped: u64 = 0;

    loop {
        // Drain commands promptly even if the stream is stalled.
        if let Ok(Cmd::Shutdown) = cmd_rx.try_recv() {
            return;
        }

        let samples = match sample_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(samples) => samples,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };
        pending.extend_from_slice(&samples);

        while pending.len() >= need {
            let raw: Vec<f32> = pending.drain(..need).collect();
            let chunk = match resample_mono(&raw, device_rate_hz, target_rate_hz) {
                Ok(c) => c,
                Err(e) => {
                    log::error!("resample failed, dropping chunk: {e}");
                    continue;
                }
            };

            match chunk_tx.try_send(chunk) {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    dropped = dropped.saturating_add(1);
                    if should_emit_drop_warning(dropped) {
                        log::warn!("capture queue full, dropped {dropped} audio chunks");
                    }
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}
