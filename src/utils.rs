//! Utility functions shared by the convolution components
//!
//! Power-of-two helpers for transform orders, level measurement, and
//! impulse response normalization.

use crate::{AudioError, AudioResult, Sample};

/// Find the next power of two greater than or equal to n
pub fn next_power_of_two(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let mut power = 1;
    while power < n {
        power *= 2;
    }
    power
}

/// Integer log2 of a power of two.
///
/// Returns `InvalidBlockSize` if `n` is zero or not a power of two.
pub fn ilog2(n: usize) -> AudioResult<usize> {
    if n == 0 || !n.is_power_of_two() {
        return Err(AudioError::InvalidBlockSize);
    }
    Ok(n.trailing_zeros() as usize)
}

/// Calculate RMS (Root Mean Square) of a buffer
pub fn calculate_rms(buffer: &[Sample]) -> Sample {
    if buffer.is_empty() {
        return 0.0;
    }

    let sum_squares: Sample = buffer.iter().map(|&x| x * x).sum();
    (sum_squares / (buffer.len() as Sample)).sqrt()
}

/// Calculate peak amplitude of a buffer
pub fn calculate_peak(buffer: &[Sample]) -> Sample {
    buffer.iter().map(|&x| x.abs()).fold(0.0, f32::max)
}

/// Gain that scales `buffer` to unit energy (`1 / sqrt(sum x^2)`).
///
/// Silent buffers get a factor of 1.
pub fn energy_factor(buffer: &[Sample]) -> Sample {
    let energy: Sample = buffer.iter().map(|&x| x * x).sum();
    if energy == 0.0 {
        return 1.0;
    }
    1.0 / energy.sqrt()
}

/// Normalize a (multi-channel) impulse response to unit energy.
///
/// Every channel is scaled by the smallest per-channel factor, so the loudest
/// channel ends up with unit energy and the level differences between
/// channels are kept.
///
/// # Example
///
/// ```rust
/// use upconv::normalize_impulse;
///
/// let mut ir = vec![vec![3.0, 4.0], vec![0.3, 0.4]];
/// normalize_impulse(&mut ir).unwrap();
/// assert!((ir[0][0] - 0.6).abs() < 1e-6);
/// assert!((ir[1][0] - 0.06).abs() < 1e-6);
/// ```
pub fn normalize_impulse(channels: &mut [Vec<Sample>]) -> AudioResult<()> {
    if channels.is_empty() {
        return Err(AudioError::InsufficientData);
    }

    // Silent channels must not pin the factor to 1
    let factor = channels
        .iter()
        .filter(|channel| channel.iter().any(|&x| x != 0.0))
        .map(|channel| energy_factor(channel))
        .fold(Sample::INFINITY, Sample::min);

    if !factor.is_finite() {
        log::warn!("normalize_impulse: all channels are silent, leaving impulse unchanged");
        return Ok(());
    }

    for channel in channels.iter_mut() {
        for sample in channel.iter_mut() {
            *sample *= factor;
        }
    }

    Ok(())
}
