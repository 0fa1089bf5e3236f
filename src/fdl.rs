//! Frequency-domain delay line
//!
//! A fixed arena of `N` spectra (one per filter partition) plus a write
//! cursor. Every processed block writes its spectrum at the cursor, pairs
//! filter partition `i` with the slot written `i` blocks ago, and advances
//! the cursor by one slot with wraparound.
//!
//! [`FrequencyDelayLine`] stores full-precision bins. [`CompressedDelayLine`]
//! stores 16-bit fixed-point bins and expands one slot at a time when it is
//! handed to the filter.

use crate::{Bin, Sample};
use rustfft::num_complex::Complex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// `(slot, partition)` pairings for a cursor at `write_pos` over `n` slots
#[inline]
fn pairings(write_pos: usize, n: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..n).map(move |i| ((write_pos + n - i) % n, i))
}

/// Storage for the last `N` input spectra, as seen by the engine.
pub trait DelayLine: Send {
    /// Number of slots (`N`)
    fn len(&self) -> usize;

    /// Always false; a delay line has at least one slot
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bins per slot
    fn bins(&self) -> usize;

    /// Slot the next insertion writes to
    fn write_pos(&self) -> usize;

    /// Copy the spectrum stored in `slot` into `out`
    fn read_slot(&self, slot: usize, out: &mut [Bin]);

    /// Insert a spectrum, hand every `(slot spectrum, partition)` pairing to
    /// `multiply`, then advance the cursor
    fn push(&mut self, spectrum: &[Bin], multiply: &mut dyn FnMut(&[Bin], usize));

    /// Clear every slot and rewind the cursor
    fn reset(&mut self);
}

/// Rotating store of the last `N` input spectra.
///
/// # Example
///
/// ```rust
/// use upconv::{Complex, FrequencyDelayLine};
///
/// let mut fdl = FrequencyDelayLine::new(3, 2);
/// for block in 0..4 {
///     let spectrum = [Complex::new(block as f32, 0.0); 2];
///     fdl.push(&spectrum, |slot, partition| {
///         // partition 0 always sees the newest block
///         if partition == 0 {
///             assert_eq!(slot[0].re, block as f32);
///         }
///     });
/// }
/// assert_eq!(fdl.write_pos(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct FrequencyDelayLine {
    /// Slot-major arena, `slots * bins` values
    slots: Vec<Bin>,
    num_slots: usize,
    bins: usize,
    write_pos: usize,
}

impl FrequencyDelayLine {
    /// Allocate a delay line of `slots` spectra with `bins` bins each
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn new(slots: usize, bins: usize) -> Self {
        assert!(slots > 0, "frequency delay line needs at least one slot");
        Self {
            slots: vec![Complex::new(0.0, 0.0); slots * bins],
            num_slots: slots,
            bins,
            write_pos: 0,
        }
    }

    /// Number of slots (`N`)
    pub fn len(&self) -> usize {
        self.num_slots
    }

    /// Always false; a delay line has at least one slot
    pub fn is_empty(&self) -> bool {
        self.num_slots == 0
    }

    /// Bins per slot
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Slot the next insertion writes to
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Spectrum stored in `slot`
    pub fn slot(&self, slot: usize) -> &[Bin] {
        let start = slot * self.bins;
        &self.slots[start..start + self.bins]
    }

    /// Store `spectrum` at the write cursor
    ///
    /// # Panics
    ///
    /// Panics if `spectrum.len() != self.bins()`.
    #[inline]
    pub fn insert(&mut self, spectrum: &[Bin]) {
        let start = self.write_pos * self.bins;
        self.slots[start..start + self.bins].copy_from_slice(spectrum);
    }

    /// `(fdl_slot, filter_partition)` pairings for the current cursor
    ///
    /// Filter partition `i` is paired with the block inserted `i` blocks ago.
    #[inline]
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        pairings(self.write_pos, self.num_slots)
    }

    /// Move the cursor to the next slot, wrapping at `N`
    #[inline]
    pub fn advance(&mut self) {
        self.write_pos += 1;
        if self.write_pos >= self.num_slots {
            self.write_pos = 0;
        }
    }

    /// Insert a spectrum, visit every pairing, then advance
    ///
    /// `multiply` receives the slot spectrum and the filter partition index
    /// it has to be multiplied with.
    #[inline]
    pub fn push<F>(&mut self, spectrum: &[Bin], mut multiply: F)
    where
        F: FnMut(&[Bin], usize),
    {
        self.insert(spectrum);
        for (slot, partition) in self.pairs() {
            multiply(self.slot(slot), partition);
        }
        self.advance();
    }

    /// Clear every slot and rewind the cursor
    pub fn reset(&mut self) {
        self.slots.fill(Complex::new(0.0, 0.0));
        self.write_pos = 0;
    }
}

impl DelayLine for FrequencyDelayLine {
    fn len(&self) -> usize {
        self.num_slots
    }

    fn bins(&self) -> usize {
        self.bins
    }

    fn write_pos(&self) -> usize {
        self.write_pos
    }

    fn read_slot(&self, slot: usize, out: &mut [Bin]) {
        out.copy_from_slice(self.slot(slot));
    }

    fn push(&mut self, spectrum: &[Bin], multiply: &mut dyn FnMut(&[Bin], usize)) {
        FrequencyDelayLine::push(self, spectrum, multiply);
    }

    fn reset(&mut self) {
        FrequencyDelayLine::reset(self);
    }
}

/// Delay line holding 16-bit fixed-point spectra.
///
/// Each bin is stored as `round(value / full_scale * i16::MAX)`, a quarter
/// of the memory of a full-precision slot. Values beyond `full_scale`
/// saturate. The quantization step is `full_scale / i16::MAX`.
///
/// # Example
///
/// ```rust
/// use upconv::{Complex, CompressedDelayLine, DelayLine};
///
/// let mut fdl = CompressedDelayLine::new(2, 3, 8.0);
/// fdl.push(&[Complex::new(1.0, -0.5); 3], &mut |slot, partition| {
///     if partition == 0 {
///         assert!((slot[0].re - 1.0).abs() < 1e-3);
///     }
/// });
/// assert_eq!(fdl.write_pos(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct CompressedDelayLine {
    /// Slot-major arena, `slots * bins` values
    slots: Vec<Complex<i16>>,
    num_slots: usize,
    bins: usize,
    write_pos: usize,
    to_fixed: Sample,
    to_float: Sample,
    /// The slot currently handed out, expanded
    expanded: Vec<Bin>,
}

impl CompressedDelayLine {
    /// Allocate a delay line of `slots` spectra with `bins` bins each,
    /// quantized against `full_scale`
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero or `full_scale` is not positive and finite.
    pub fn new(slots: usize, bins: usize, full_scale: Sample) -> Self {
        assert!(slots > 0, "frequency delay line needs at least one slot");
        assert!(
            full_scale.is_finite() && full_scale > 0.0,
            "full scale must be positive and finite"
        );
        let max = i16::MAX as Sample;
        Self {
            slots: vec![Complex::new(0, 0); slots * bins],
            num_slots: slots,
            bins,
            write_pos: 0,
            to_fixed: max / full_scale,
            to_float: full_scale / max,
            expanded: vec![Complex::new(0.0, 0.0); bins],
        }
    }

    /// Largest representable magnitude per component
    pub fn full_scale(&self) -> Sample {
        self.to_float * i16::MAX as Sample
    }

    /// Quantization step
    pub fn step(&self) -> Sample {
        self.to_float
    }

    #[inline]
    fn quantize(value: Sample, to_fixed: Sample) -> i16 {
        // `as` saturates out-of-range values and maps NaN to 0
        (value * to_fixed).round() as i16
    }

    #[inline]
    fn expand_into(stored: &[Complex<i16>], to_float: Sample, out: &mut [Bin]) {
        for (out, q) in out.iter_mut().zip(stored) {
            *out = Complex::new(q.re as Sample * to_float, q.im as Sample * to_float);
        }
    }
}

impl DelayLine for CompressedDelayLine {
    fn len(&self) -> usize {
        self.num_slots
    }

    fn bins(&self) -> usize {
        self.bins
    }

    fn write_pos(&self) -> usize {
        self.write_pos
    }

    fn read_slot(&self, slot: usize, out: &mut [Bin]) {
        let start = slot * self.bins;
        Self::expand_into(&self.slots[start..start + self.bins], self.to_float, out);
    }

    fn push(&mut self, spectrum: &[Bin], multiply: &mut dyn FnMut(&[Bin], usize)) {
        let bins = self.bins;
        let to_fixed = self.to_fixed;
        let start = self.write_pos * bins;
        assert_eq!(spectrum.len(), bins, "spectrum does not match delay line bins");
        for (stored, value) in self.slots[start..start + bins].iter_mut().zip(spectrum) {
            *stored = Complex::new(
                Self::quantize(value.re, to_fixed),
                Self::quantize(value.im, to_fixed),
            );
        }

        for (slot, partition) in pairings(self.write_pos, self.num_slots) {
            let start = slot * bins;
            Self::expand_into(&self.slots[start..start + bins], self.to_float, &mut self.expanded);
            multiply(&self.expanded, partition);
        }

        self.write_pos += 1;
        if self.write_pos >= self.num_slots {
            self.write_pos = 0;
        }
    }

    fn reset(&mut self) {
        self.slots.fill(Complex::new(0, 0));
        self.expanded.fill(Complex::new(0.0, 0.0));
        self.write_pos = 0;
    }
}

/// Delay line storage chosen at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DelayLineKind {
    /// Full-precision bins
    #[default]
    Dense,
    /// 16-bit fixed-point bins
    ///
    /// Full scale is `2B`, the largest bin magnitude a window of samples in
    /// `[-1, 1]` can produce, so such input never saturates.
    Compressed,
}

impl DelayLineKind {
    /// Build a delay line of `slots` spectra with `bins` bins each
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero or `bins` is below 2.
    pub fn build(&self, slots: usize, bins: usize) -> Box<dyn DelayLine> {
        match self {
            DelayLineKind::Dense => Box::new(FrequencyDelayLine::new(slots, bins)),
            DelayLineKind::Compressed => {
                let full_scale = (2 * bins.saturating_sub(1)) as Sample;
                Box::new(CompressedDelayLine::new(slots, bins, full_scale))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum(value: f32, bins: usize) -> Vec<Bin> {
        vec![Complex::new(value, -value); bins]
    }

    #[test]
    fn test_pairs_at_start() {
        let fdl = FrequencyDelayLine::new(4, 3);
        let pairs: Vec<_> = fdl.pairs().collect();
        assert_eq!(pairs, vec![(0, 0), (3, 1), (2, 2), (1, 3)]);
    }

    #[test]
    fn test_partition_i_sees_block_i_ago() {
        let n = 5;
        let mut fdl = FrequencyDelayLine::new(n, 2);

        for block in 0..17 {
            fdl.push(&spectrum(block as f32, 2), |slot, partition| {
                let expected = block as i32 - partition as i32;
                if expected >= 0 {
                    assert_eq!(slot[0].re, expected as f32);
                } else {
                    // never written yet
                    assert_eq!(slot[0].re, 0.0);
                }
            });
        }
    }

    #[test]
    fn test_wraparound_after_2n_plus_1_blocks() {
        let n = 4;
        let bins = 3;
        let mut fdl = FrequencyDelayLine::new(n, bins);

        let total = 2 * n + 1;
        for block in 0..total {
            fdl.push(&spectrum(block as f32 + 1.0, bins), |_, _| {});
        }
        assert_eq!(fdl.write_pos(), 1 % n);

        // Slot k holds the newest block written there: re-derive from the last N blocks
        for block in (total - n)..total {
            let slot = block % n;
            assert_eq!(fdl.slot(slot), spectrum(block as f32 + 1.0, bins).as_slice());
        }
    }

    #[test]
    fn test_single_slot() {
        let mut fdl = FrequencyDelayLine::new(1, 2);
        let mut visits = 0;
        fdl.push(&spectrum(7.0, 2), |slot, partition| {
            assert_eq!(partition, 0);
            assert_eq!(slot[1].re, 7.0);
            visits += 1;
        });
        assert_eq!(visits, 1);
        assert_eq!(fdl.write_pos(), 0);
    }

    #[test]
    fn test_every_partition_visited_once_per_block() {
        let mut fdl = FrequencyDelayLine::new(6, 1);
        for _ in 0..10 {
            let mut slots: Vec<usize> = fdl.pairs().map(|(slot, _)| slot).collect();
            slots.sort_unstable();
            assert_eq!(slots, (0..6).collect::<Vec<_>>());

            let mut seen = vec![0; 6];
            let before = fdl.write_pos();
            fdl.push(&spectrum(1.0, 1), |_, partition| seen[partition] += 1);
            assert!(seen.iter().all(|&count| count == 1));
            assert_eq!(fdl.write_pos(), (before + 1) % 6);
        }
    }

    #[test]
    fn test_reset() {
        let mut fdl = FrequencyDelayLine::new(3, 2);
        fdl.push(&spectrum(1.0, 2), |_, _| {});
        fdl.push(&spectrum(2.0, 2), |_, _| {});
        fdl.reset();
        assert_eq!(fdl.write_pos(), 0);
        for slot in 0..3 {
            assert!(fdl.slot(slot).iter().all(|b| b.norm() == 0.0));
        }
        assert_eq!(fdl.len(), 3);
        assert!(!fdl.is_empty());
        assert_eq!(fdl.bins(), 2);
    }

    fn ramp(bins: usize, offset: f32) -> Vec<Bin> {
        (0..bins)
            .map(|k| Complex::new(offset + k as f32 * 0.37, offset - k as f32 * 0.21))
            .collect()
    }

    #[test]
    fn test_compressed_matches_dense_within_one_step() {
        let n = 4;
        let bins = 9;
        let mut dense = FrequencyDelayLine::new(n, bins);
        let mut compressed = CompressedDelayLine::new(n, bins, 16.0);
        let step = compressed.step();

        for block in 0..11 {
            let input = ramp(bins, block as f32 * 0.5 - 2.0);
            let mut expected = Vec::new();
            dense.push(&input, |slot, partition| expected.push((slot.to_vec(), partition)));

            let mut visited = 0;
            compressed.push(&input, &mut |slot, partition| {
                let (reference, expected_partition) = &expected[visited];
                assert_eq!(partition, *expected_partition);
                for (got, want) in slot.iter().zip(reference) {
                    assert!((got.re - want.re).abs() <= step);
                    assert!((got.im - want.im).abs() <= step);
                }
                visited += 1;
            });
            assert_eq!(visited, n);
            assert_eq!(DelayLine::write_pos(&compressed), dense.write_pos());
        }
    }

    #[test]
    fn test_compressed_read_slot_and_wraparound() {
        let n = 3;
        let bins = 5;
        let mut fdl = CompressedDelayLine::new(n, bins, 32.0);
        let total = 2 * n + 1;
        for block in 0..total {
            fdl.push(&ramp(bins, block as f32), &mut |_, _| {});
        }
        assert_eq!(fdl.write_pos(), 1 % n);

        let mut out = vec![Complex::new(0.0, 0.0); bins];
        for block in (total - n)..total {
            fdl.read_slot(block % n, &mut out);
            for (got, want) in out.iter().zip(ramp(bins, block as f32)) {
                assert!((got.re - want.re).abs() <= fdl.step());
                assert!((got.im - want.im).abs() <= fdl.step());
            }
        }
    }

    #[test]
    fn test_compressed_saturates_beyond_full_scale() {
        let mut fdl = CompressedDelayLine::new(1, 2, 1.0);
        assert!((fdl.full_scale() - 1.0).abs() < 1e-6);
        let loud = vec![Complex::new(5.0, -5.0), Complex::new(0.25, Sample::NAN)];
        fdl.push(&loud, &mut |slot, _| {
            assert!((slot[0].re - 1.0).abs() < 1e-6);
            assert!((slot[0].im + 1.0).abs() < 1e-4);
            assert!((slot[1].re - 0.25).abs() <= 1e-4);
            assert_eq!(slot[1].im, 0.0);
        });
    }

    #[test]
    fn test_compressed_reset() {
        let mut fdl = CompressedDelayLine::new(2, 3, 4.0);
        fdl.push(&ramp(3, 1.0), &mut |_, _| {});
        fdl.reset();
        assert_eq!(fdl.write_pos(), 0);
        let mut out = vec![Complex::new(1.0, 1.0); 3];
        for slot in 0..2 {
            fdl.read_slot(slot, &mut out);
            assert!(out.iter().all(|b| b.norm() == 0.0));
        }
    }

    #[test]
    fn test_delay_line_kind_build() {
        assert_eq!(DelayLineKind::default(), DelayLineKind::Dense);

        let dense = DelayLineKind::Dense.build(4, 65);
        assert_eq!(dense.len(), 4);
        assert_eq!(dense.bins(), 65);
        assert!(!dense.is_empty());

        let mut compressed = DelayLineKind::Compressed.build(4, 65);
        assert_eq!(compressed.len(), 4);
        assert_eq!(compressed.bins(), 65);

        // Full scale is 2B = 128: a DC bin of 128 survives unsaturated
        let mut spectrum = vec![Complex::new(0.0, 0.0); 65];
        spectrum[0] = Complex::new(128.0, 0.0);
        compressed.push(&spectrum, &mut |slot, partition| {
            if partition == 0 {
                assert!((slot[0].re - 128.0).abs() < 1e-2);
            }
        });
    }
}
