pub mod capture;
pub mod pcm;
pub mod playback;
pub mod resample;

pub use capture::{CaptureConfig, CaptureError, MicCapture};
pub use pcm::{PcmError, decode_s16le, encode_s16le, mean_abs_amplitude, passes_noise_gate};
pub use playback::Speaker;
