//
// Transport codec for the live channel: mono f32 samples in [-1, 1] on our
// side, little-endian signed 16-bit PCM on the wire.

#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// Encode f32 samples to s16le bytes.
///
/// Scaling is asymmetric on purpose: negative samples map onto the full
/// -32768 range while positive samples top out at 32767, so -1.0 and 1.0
/// both hit the integer extremes exactly.
pub fn encode_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let v = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode s16le bytes to f32 samples in [-1, 1].
///
/// An odd byte count means the payload was truncated somewhere; that is a
/// decode error for the whole message, not a signal to floor the length.
pub fn decode_s16le(bytes: &[u8]) -> Result<Vec<f32>, PcmError> {
    if bytes.len() % 2 != 0 {
        return Err(PcmError::OddLength(bytes.len()));
    }

    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let v = i16::from_le_bytes([pair[0], pair[1]]);
        let f = if v < 0 {
            v as f32 / 32768.0
        } else {
            v as f32 / 32767.0
        };
        out.push(f);
    }
    Ok(out)
}

/// Mean absolute amplitude of a chunk. Empty chunks report 0.0.
pub fn mean_abs_amplitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Silence suppression: a chunk is sent only when its mean absolute
/// amplitude strictly exceeds the gate threshold.
pub fn passes_noise_gate(samples: &[f32], threshold: f32) -> bool {
    mean_abs_amplitude(samples) > threshold
}
