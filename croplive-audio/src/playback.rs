//
// CPAL speaker playback for response audio.
//
// The session decodes inbound 24 kHz PCM and enqueues it here; a worker
// thread owns the output stream (cpal streams are not Send) and the output
// callback drains one shared sample queue, so parts play back-to-back and a
// torn-down session simply stops enqueueing.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::capture::CaptureError;
use crate::resample::resample_mono;

/// Playback handle. `play` is cheap and non-blocking; dropping the speaker
/// stops the output stream.
pub struct Speaker {
    cmd_tx: mpsc::Sender<Cmd>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

enum Cmd {
    Enqueue { samples: Vec<f32>, rate_hz: u32 },
    Shutdown,
}

enum WorkerMsg {
    Ready,
    Error(String),
}

impl Speaker {
    pub fn open() -> Result<Self, CaptureError> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Cmd>();
        let (worker_tx, worker_rx) = mpsc::channel::<WorkerMsg>();

        let worker_handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = worker_tx.send(WorkerMsg::Error("no output device found".into()));
                return;
            };

            let config = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = worker_tx.send(WorkerMsg::Error(format!("default config: {e}")));
                    return;
                }
            };
            let device_rate_hz = config.sample_rate().0;
            let channels = config.channels() as usize;

            let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
            let cb_queue = queue.clone();

            let stream = device.build_output_stream(
                &config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut q = cb_queue.lock().unwrap();
                    for frame in data.chunks_exact_mut(channels) {
                        let s = q.pop_front().unwrap_or(0.0);
                        for slot in frame {
                            *slot = s;
                        }
                    }
                },
                |err| {
                    log::error!("audio output stream error: {err}");
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = worker_tx.send(WorkerMsg::Error(format!("build stream: {e}")));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = worker_tx.send(WorkerMsg::Error(format!("play stream: {e}")));
                return;
            }

            let _ = worker_tx.send(WorkerMsg::Ready);

            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Cmd::Enqueue { samples, rate_hz } => {
                        let samples = if rate_hz == device_rate_hz {
                            samples
                        } else {
                            match resample_mono(&samples, rate_hz, device_rate_hz) {
                                Ok(s) => s,
                                Err(e) => {
                                    log::error!("playback resample failed, dropping: {e}");
                                    continue;
                                }
                            }
                        };
                        queue.lock().unwrap().extend(samples);
                    }
                    Cmd::Shutdown => break,
                }
            }

            drop(stream);
        });

        match worker_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(WorkerMsg::Ready) => {}
            Ok(WorkerMsg::Error(e)) => return Err(CaptureError::Worker(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(CaptureError::WorkerTimeout),
            Err(_) => return Err(CaptureError::Channel),
        }

        Ok(Self {
            cmd_tx,
            worker_handle: Some(worker_handle),
        })
    }

    /// Queue mono samples at `rate_hz` for playback.
    pub fn play(&self, samples: Vec<f32>, rate_hz: u32) {
        let _ = self.cmd_tx.send(Cmd::Enqueue { samples, rate_hz });
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
        if let Some(h) = self.worker_handle.take() {
            let _ = h.join();
        }
    }
}
