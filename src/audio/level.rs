//! Loudness helpers shared by the VAD policy and the microphone adapter.

/// RMS loudness of a 16-bit chunk on the raw sample scale (0..=32768).
pub fn rms_i16(samples: &[i16]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&sample| {
            let value = f64::from(sample);
            value * value
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt().round() as u32
}

pub(crate) fn float_sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped >= 0.0 {
        (clamped * i16::MAX as f32).round() as i16
    } else {
        (clamped * 32_768.0).round() as i16
    }
}

/// Average interleaved frames into one channel.
#[inline]
pub(crate) fn downmix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Integer counterpart of [`downmix_to_mono`] for devices that deliver i16 frames.
pub(crate) fn downmix_i16_to_mono(data: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&sample| i32::from(sample)).sum();
            (sum / ch as i32) as i16
        })
        .collect()
}
