use anyhow::Context;
use rubato::Resampler;

/// Resample a mono f32 buffer to a target rate.
///
/// Used at the capture boundary (device rates that won't open at 16 kHz)
/// and at the playback boundary (24 kHz response audio on outputs that run
/// at 44.1/48 kHz). Identity rates short-circuit.
pub fn resample_mono(
    samples: &[f32],
    input_rate_hz: u32,
    target_rate_hz: u32,
) -> anyhow::Result<Vec<f32>> {
    if input_rate_hz == target_rate_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = target_rate_hz as f64 / input_rate_hz as f64;
    let params = rubato::SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    };

    let mut resampler = rubato::SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)
        .context("create resampler")?;

    let out = resampler
        .process(&[samples.to_vec()], None)
        .context("resample chunk")?;
    Ok(out.into_iter().next().unwrap_or_default())
}

/// Input samples needed at `input_rate_hz` to yield roughly `target_samples`
/// after resampling to `target_rate_hz`.
pub fn input_len_for(target_samples: usize, input_rate_hz: u32, target_rate_hz: u32) -> usize {
    if input_rate_hz == target_rate_hz {
        return target_samples;
    }
    let scaled = target_samples as u64 * input_rate_hz as u64;
    scaled.div_ceil(target_rate_hz as u64) as usize
}
