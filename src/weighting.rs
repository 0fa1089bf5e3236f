//! Perceptual frequency weighting for sparse filter pruning
//!
//! A weighting curve maps a frequency in Hz to a level offset in dB. The
//! sparse filter adds this offset to each bin's normalized magnitude before
//! comparing it against the pruning threshold, so bins in regions the ear is
//! less sensitive to are dropped earlier.

use crate::Sample;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Floor used when converting silence to decibels.
pub const SILENCE_DB: Sample = -144.0;

/// Frequency weighting curve applied before thresholding.
///
/// # Example
///
/// ```rust
/// use upconv::Weighting;
///
/// assert_eq!(Weighting::Flat.weight(100.0), 0.0);
/// assert!(Weighting::A.weight(100.0) < -15.0);
/// assert!(Weighting::A.weight(1000.0).abs() < 0.1);
///
/// fn tilt(frequency: f32) -> f32 {
///     -frequency / 1000.0
/// }
/// assert_eq!(Weighting::Custom(tilt).weight(2000.0), -2.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Weighting {
    /// No weighting (every frequency offset by 0 dB)
    #[default]
    Flat,
    /// IEC 61672 A-weighting
    A,
    /// Caller-provided curve, frequency in Hz to offset in dB
    #[cfg_attr(feature = "serde", serde(skip))]
    Custom(fn(Sample) -> Sample),
}

/// `Custom` curves compare by function address. Identical functions may
/// or may not share an address, so two distinct curves with the same body
/// can compare equal.
impl PartialEq for Weighting {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Weighting::Flat, Weighting::Flat) | (Weighting::A, Weighting::A) => true,
            (Weighting::Custom(a), Weighting::Custom(b)) => std::ptr::fn_addr_eq(*a, *b),
            _ => false,
        }
    }
}

impl Weighting {
    /// Level offset in dB at `frequency` Hz
    pub fn weight(&self, frequency: Sample) -> Sample {
        match self {
            Weighting::Flat => 0.0,
            Weighting::A => {
                // DC has no meaningful A-weighted level
                if frequency == 0.0 {
                    0.0
                } else {
                    a_weighting(frequency)
                }
            }
            Weighting::Custom(curve) => curve(frequency),
        }
    }
}

/// A-weighting in dB, normalized to roughly 0 dB at 1 kHz.
///
/// Returns negative infinity at 0 Hz; [`Weighting::A`] maps DC to 0 instead.
pub fn a_weighting(frequency: Sample) -> Sample {
    const C0: Sample = 12194.217 * 12194.217;
    const C1: Sample = 20.598997 * 20.598997;
    const C2: Sample = 107.65265 * 107.65265;
    const C3: Sample = 737.86223 * 737.86223;

    let f_sq = frequency * frequency;
    2.0 + 20.0
        * (C0.log10() + 2.0 * f_sq.log10()
            - (f_sq + C0).log10()
            - (f_sq + C1).log10()
            - 0.5 * (f_sq + C2).log10()
            - 0.5 * (f_sq + C3).log10())
}

/// Convert a linear gain to decibels, clamped at [`SILENCE_DB`]
pub fn amplitude_to_db(gain: Sample) -> Sample {
    if gain <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * gain.log10()).max(SILENCE_DB)
}

/// Center frequency of `bin` for a real transform of `transform_size` points
pub fn bin_frequency(bin: usize, transform_size: usize, sample_rate: Sample) -> Sample {
    bin as Sample * sample_rate / transform_size as Sample
}
