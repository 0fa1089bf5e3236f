//! Overlap-add and overlap-save block reconstruction
//!
//! Both reconstructors take `B` real samples per call, run a `2B`-point real
//! transform, hand the `B + 1` bin spectrum to a callback that replaces it
//! with the output spectrum, and turn the inverse transform back into `B`
//! output samples. They differ in where the circular-convolution wraparound
//! is discarded: overlap-save throws away the first half of the inverse
//! transform, overlap-add sums the second half into the next block.
//!
//! Neither variant rescales after the inverse transform; the filter
//! partitions already carry the `1 / (2B)` factor.

use crate::{AudioError, AudioResult, Bin, Sample, Transform};
use rustfft::num_complex::Complex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Block-wise time/frequency reconstruction.
pub trait Overlap: Send {
    /// Samples consumed and produced per call (`B`)
    fn block_size(&self) -> usize;

    /// Size of the transform window (`2B`)
    fn transform_size(&self) -> usize {
        2 * self.block_size()
    }

    /// Transform `block`, let `spectral` rewrite its `B + 1` bin spectrum,
    /// and write the reconstructed output back into `block`.
    fn process(
        &mut self,
        block: &mut [Sample],
        spectral: &mut dyn FnMut(&mut [Bin]),
    ) -> AudioResult<()>;

    /// Forget all carried samples
    fn reset(&mut self);
}

fn check_transform(block_size: usize, transform: &dyn Transform) -> AudioResult<()> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(AudioError::InvalidBlockSize);
    }
    if transform.len() != 2 * block_size {
        return Err(AudioError::InvalidOrder);
    }
    Ok(())
}

/// Overlap-save reconstruction.
///
/// Keeps the previous input block; the transform window is
/// `[previous B | new B]` and only the second half of the inverse transform
/// is emitted.
pub struct OverlapSave {
    transform: Box<dyn Transform>,
    block_size: usize,
    /// Last input block
    history: Vec<Sample>,
    window: Vec<Sample>,
    spectrum: Vec<Bin>,
}

impl OverlapSave {
    /// Create a reconstructor around a `2B`-point transform
    ///
    /// # Errors
    /// - `InvalidBlockSize` if `block_size` is not a non-zero power of two
    /// - `InvalidOrder` if the transform is not `2 * block_size` points
    pub fn new(block_size: usize, transform: Box<dyn Transform>) -> AudioResult<Self> {
        check_transform(block_size, transform.as_ref())?;
        let size = transform.len();
        Ok(Self {
            block_size,
            history: vec![0.0; block_size],
            window: vec![0.0; size],
            spectrum: vec![Complex::new(0.0, 0.0); transform.bins()],
            transform,
        })
    }
}

impl Overlap for OverlapSave {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn process(
        &mut self,
        block: &mut [Sample],
        spectral: &mut dyn FnMut(&mut [Bin]),
    ) -> AudioResult<()> {
        if block.len() != self.block_size {
            return Err(AudioError::BufferSizeMismatch);
        }
        let b = self.block_size;

        // The forward transform clobbers its input, so the window is rebuilt
        // from the saved history every block
        self.window[..b].copy_from_slice(&self.history);
        self.window[b..].copy_from_slice(block);
        self.history.copy_from_slice(block);

        self.transform
            .real_forward(&mut self.window, &mut self.spectrum)?;
        spectral(&mut self.spectrum);
        self.transform
            .real_inverse(&mut self.spectrum, &mut self.window)?;

        // First half is circular wraparound
        block.copy_from_slice(&self.window[b..]);
        Ok(())
    }

    fn reset(&mut self) {
        self.history.fill(0.0);
    }
}

/// Overlap-add reconstruction.
///
/// Zero-pads each input block to `2B`; the full inverse transform is added
/// into a `2B` tail, whose first half is emitted and whose second half
/// carries into the next block.
pub struct OverlapAdd {
    transform: Box<dyn Transform>,
    block_size: usize,
    buffer: Vec<Sample>,
    spectrum: Vec<Bin>,
    /// Output not emitted yet
    tail: Vec<Sample>,
}

impl OverlapAdd {
    /// Create a reconstructor around a `2B`-point transform
    ///
    /// # Errors
    /// - `InvalidBlockSize` if `block_size` is not a non-zero power of two
    /// - `InvalidOrder` if the transform is not `2 * block_size` points
    pub fn new(block_size: usize, transform: Box<dyn Transform>) -> AudioResult<Self> {
        check_transform(block_size, transform.as_ref())?;
        let size = transform.len();
        Ok(Self {
            block_size,
            buffer: vec![0.0; size],
            spectrum: vec![Complex::new(0.0, 0.0); transform.bins()],
            tail: vec![0.0; size],
            transform,
        })
    }
}

impl Overlap for OverlapAdd {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn process(
        &mut self,
        block: &mut [Sample],
        spectral: &mut dyn FnMut(&mut [Bin]),
    ) -> AudioResult<()> {
        if block.len() != self.block_size {
            return Err(AudioError::BufferSizeMismatch);
        }
        let b = self.block_size;

        self.buffer[..b].copy_from_slice(block);
        self.buffer[b..].fill(0.0);

        self.transform
            .real_forward(&mut self.buffer, &mut self.spectrum)?;
        spectral(&mut self.spectrum);
        self.transform
            .real_inverse(&mut self.spectrum, &mut self.buffer)?;

        for (tail, &sample) in self.tail.iter_mut().zip(&self.buffer) {
            *tail += sample;
        }

        block.copy_from_slice(&self.tail[..b]);

        // Shift the carried half down and clear the upper half
        self.tail.copy_within(b.., 0);
        self.tail[b..].fill(0.0);
        Ok(())
    }

    fn reset(&mut self) {
        self.tail.fill(0.0);
    }
}

/// Reconstruction strategy chosen at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OverlapMode {
    /// Overlap-add
    Add,
    /// Overlap-save
    #[default]
    Save,
}

impl OverlapMode {
    /// Build the reconstructor for `block_size` around a `2B`-point transform
    pub fn build(
        &self,
        block_size: usize,
        transform: Box<dyn Transform>,
    ) -> AudioResult<Box<dyn Overlap>> {
        Ok(match self {
            OverlapMode::Add => Box::new(OverlapAdd::new(block_size, transform)?),
            OverlapMode::Save => Box::new(OverlapSave::new(block_size, transform)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RustFftPlanner, TransformPlanner};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn noise(len: usize, seed: u64) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn build(mode: OverlapMode, block_size: usize) -> Box<dyn Overlap> {
        let order = block_size.trailing_zeros() as usize + 1;
        let transform = RustFftPlanner::new().plan(order).unwrap();
        mode.build(block_size, transform).unwrap()
    }

    /// Run `signal` through `overlap`, applying `gain[k]` to every bin
    fn run(overlap: &mut dyn Overlap, signal: &[Sample], gain: &[Bin]) -> Vec<Sample> {
        let mut output = signal.to_vec();
        for block in output.chunks_mut(overlap.block_size()) {
            overlap
                .process(block, &mut |spectrum: &mut [Bin]| {
                    assert_eq!(spectrum.len(), gain.len());
                    for (bin, g) in spectrum.iter_mut().zip(gain) {
                        *bin *= *g;
                    }
                })
                .unwrap();
        }
        output
    }

    #[test]
    fn test_scaled_passthrough_reproduces_input() {
        for mode in [OverlapMode::Add, OverlapMode::Save] {
            for block_size in [128, 512] {
                let mut overlap = build(mode, block_size);
                assert_eq!(overlap.block_size(), block_size);
                assert_eq!(overlap.transform_size(), 2 * block_size);

                let signal = noise(block_size * 8, 1);
                let scale = 1.0 / (2 * block_size) as Sample;
                let gain = vec![Complex::new(scale, 0.0); block_size + 1];
                let output = run(overlap.as_mut(), &signal, &gain);

                for (out, expected) in output.iter().zip(&signal) {
                    assert_abs_diff_eq!(*out, expected, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_one_sample_delay_carries_across_blocks() {
        let block_size = 16;
        let n = 2 * block_size;
        let scale = 1.0 / n as Sample;
        let gain: Vec<Bin> = (0..=block_size)
            .map(|k| {
                let phase = -2.0 * core::f32::consts::PI * k as f32 / n as f32;
                Complex::from_polar(scale, phase)
            })
            .collect();

        for mode in [OverlapMode::Add, OverlapMode::Save] {
            let mut overlap = build(mode, block_size);
            let signal = noise(block_size * 6, 2);
            let output = run(overlap.as_mut(), &signal, &gain);

            assert_abs_diff_eq!(output[0], 0.0, epsilon = 1e-5);
            for i in 1..signal.len() {
                assert_abs_diff_eq!(output[i], signal[i - 1], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_block_size_mismatch() {
        for mode in [OverlapMode::Add, OverlapMode::Save] {
            let mut overlap = build(mode, 8);
            let mut short = vec![0.0; 7];
            assert_eq!(
                overlap.process(&mut short, &mut |_: &mut [Bin]| {}),
                Err(AudioError::BufferSizeMismatch)
            );
        }
    }

    #[test]
    fn test_transform_size_must_be_twice_block() {
        let transform = RustFftPlanner::new().plan(4).unwrap();
        assert!(matches!(
            OverlapSave::new(4, transform),
            Err(AudioError::InvalidOrder)
        ));
        let transform = RustFftPlanner::new().plan(4).unwrap();
        assert!(matches!(
            OverlapAdd::new(6, transform),
            Err(AudioError::InvalidBlockSize)
        ));
    }

    #[test]
    fn test_reset_clears_carry() {
        let block_size = 8;
        let n = 2 * block_size;
        let scale = 1.0 / n as Sample;
        // Delay by half a block so every block spills into the next
        let gain: Vec<Bin> = (0..=block_size)
            .map(|k| {
                let phase = -2.0 * core::f32::consts::PI * (k * block_size / 2) as f32 / n as f32;
                Complex::from_polar(scale, phase)
            })
            .collect();

        for mode in [OverlapMode::Add, OverlapMode::Save] {
            let mut overlap = build(mode, block_size);
            run(overlap.as_mut(), &vec![1.0; block_size], &gain);
            overlap.reset();
            let output = run(overlap.as_mut(), &vec![0.0; block_size], &gain);
            assert!(output.iter().all(|&x| x.abs() < 1e-6));
        }
    }

    #[test]
    fn test_overlap_mode_default() {
        assert_eq!(OverlapMode::default(), OverlapMode::Save);
    }
}
