//! Transform service used by the partitioner and the overlap reconstructors
//!
//! The convolution logic never talks to an FFT library directly. It asks a
//! [`TransformPlanner`] for a [`Transform`] of a given order (size `2^order`)
//! and drives it through this contract. [`RustFftPlanner`] is the default
//! backend, built on `rustfft` and `realfft`.

use crate::{AudioError, AudioResult, Bin, Sample};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// A power-of-two sized transform.
///
/// All methods are unnormalized and must not allocate. Input buffers may be
/// clobbered and used as scratch by the backend.
pub trait Transform: Send {
    /// Log2 of the transform size.
    fn order(&self) -> usize;

    /// Transform size (`2^order`).
    fn len(&self) -> usize {
        1 << self.order()
    }

    /// Always false; the smallest transform has two points.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-redundant bins of the real transform (`len / 2 + 1`).
    fn bins(&self) -> usize {
        self.len() / 2 + 1
    }

    /// In-place forward complex transform of `len` values.
    fn forward(&mut self, buffer: &mut [Bin]) -> AudioResult<()>;

    /// In-place inverse complex transform of `len` values.
    fn inverse(&mut self, buffer: &mut [Bin]) -> AudioResult<()>;

    /// Forward real transform: `len` samples to `len / 2 + 1` bins.
    fn real_forward(&mut self, input: &mut [Sample], output: &mut [Bin]) -> AudioResult<()>;

    /// Inverse real transform: `len / 2 + 1` bins to `len` samples.
    fn real_inverse(&mut self, input: &mut [Bin], output: &mut [Sample]) -> AudioResult<()>;
}

/// Factory for [`Transform`] instances.
pub trait TransformPlanner: Send {
    /// Plan a transform of size `2^order`.
    fn plan(&mut self, order: usize) -> AudioResult<Box<dyn Transform>>;
}

/// Default transform backend based on `rustfft` and `realfft`.
///
/// Plans are cached inside the wrapped planners, so repeated calls with the
/// same order share twiddle tables.
pub struct RustFftPlanner {
    real: RealFftPlanner<Sample>,
    complex: FftPlanner<Sample>,
}

impl RustFftPlanner {
    /// Create a new planner
    pub fn new() -> Self {
        Self {
            real: RealFftPlanner::new(),
            complex: FftPlanner::new(),
        }
    }
}

impl Default for RustFftPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPlanner for RustFftPlanner {
    fn plan(&mut self, order: usize) -> AudioResult<Box<dyn Transform>> {
        if order == 0 || order >= (usize::BITS as usize - 1) {
            return Err(AudioError::InvalidOrder);
        }
        let len = 1usize << order;

        let fft = self.complex.plan_fft_forward(len);
        let ifft = self.complex.plan_fft_inverse(len);
        let r2c = self.real.plan_fft_forward(len);
        let c2r = self.real.plan_fft_inverse(len);

        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len())
            .max(r2c.get_scratch_len())
            .max(c2r.get_scratch_len());

        Ok(Box::new(RustFftTransform {
            order,
            fft,
            ifft,
            r2c,
            c2r,
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }))
    }
}

/// Transform planned by [`RustFftPlanner`]
pub struct RustFftTransform {
    order: usize,
    fft: Arc<dyn Fft<Sample>>,
    ifft: Arc<dyn Fft<Sample>>,
    r2c: Arc<dyn RealToComplex<Sample>>,
    c2r: Arc<dyn ComplexToReal<Sample>>,
    /// Shared scratch, sized for the largest of the four plans
    scratch: Vec<Bin>,
}

impl Transform for RustFftTransform {
    fn order(&self) -> usize {
        self.order
    }

    fn forward(&mut self, buffer: &mut [Bin]) -> AudioResult<()> {
        if buffer.len() != self.len() {
            return Err(AudioError::BufferSizeMismatch);
        }
        let scratch_len = self.fft.get_inplace_scratch_len();
        self.fft
            .process_with_scratch(buffer, &mut self.scratch[..scratch_len]);
        Ok(())
    }

    fn inverse(&mut self, buffer: &mut [Bin]) -> AudioResult<()> {
        if buffer.len() != self.len() {
            return Err(AudioError::BufferSizeMismatch);
        }
        let scratch_len = self.ifft.get_inplace_scratch_len();
        self.ifft
            .process_with_scratch(buffer, &mut self.scratch[..scratch_len]);
        Ok(())
    }

    fn real_forward(&mut self, input: &mut [Sample], output: &mut [Bin]) -> AudioResult<()> {
        if input.len() != self.len() || output.len() != self.bins() {
            return Err(AudioError::BufferSizeMismatch);
        }
        let scratch_len = self.r2c.get_scratch_len();
        self.r2c
            .process_with_scratch(input, output, &mut self.scratch[..scratch_len])?;
        Ok(())
    }

    fn real_inverse(&mut self, input: &mut [Bin], output: &mut [Sample]) -> AudioResult<()> {
        if input.len() != self.bins() || output.len() != self.len() {
            return Err(AudioError::BufferSizeMismatch);
        }

        // DC and Nyquist of a real signal have no imaginary part
        input[0].im = 0.0;
        let last = input.len() - 1;
        input[last].im = 0.0;

        let scratch_len = self.c2r.get_scratch_len();
        self.c2r
            .process_with_scratch(input, output, &mut self.scratch[..scratch_len])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_plan_sizes() {
        let mut planner = RustFftPlanner::new();
        let transform = planner.plan(4).unwrap();
        assert_eq!(transform.order(), 4);
        assert_eq!(transform.len(), 16);
        assert_eq!(transform.bins(), 9);
        assert!(!transform.is_empty());
    }

    #[test]
    fn test_plan_invalid_order() {
        let mut planner = RustFftPlanner::new();
        assert!(matches!(planner.plan(0), Err(AudioError::InvalidOrder)));
        assert!(matches!(
            planner.plan(usize::BITS as usize),
            Err(AudioError::InvalidOrder)
        ));
    }

    #[test]
    fn test_real_round_trip_is_unnormalized() {
        let mut planner = RustFftPlanner::new();
        let mut transform = planner.plan(3).unwrap();

        let signal: Vec<Sample> = vec![1.0, -2.0, 0.5, 0.0, 3.0, 0.25, -1.0, 2.0];
        let mut input = signal.clone();
        let mut spectrum = vec![Complex::new(0.0, 0.0); transform.bins()];
        let mut output = vec![0.0; transform.len()];

        transform.real_forward(&mut input, &mut spectrum).unwrap();
        transform.real_inverse(&mut spectrum, &mut output).unwrap();

        for (out, expected) in output.iter().zip(signal.iter()) {
            assert_abs_diff_eq!(*out, expected * 8.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_real_forward_of_impulse_is_flat() {
        let mut planner = RustFftPlanner::new();
        let mut transform = planner.plan(5).unwrap();

        let mut input = vec![0.0; transform.len()];
        input[0] = 1.0;
        let mut spectrum = vec![Complex::new(0.0, 0.0); transform.bins()];
        transform.real_forward(&mut input, &mut spectrum).unwrap();

        for bin in &spectrum {
            assert_abs_diff_eq!(bin.re, 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(bin.im, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_complex_round_trip() {
        let mut planner = RustFftPlanner::new();
        let mut transform = planner.plan(2).unwrap();

        let original = vec![
            Complex::new(1.0, 0.5),
            Complex::new(-1.0, 2.0),
            Complex::new(0.0, -0.5),
            Complex::new(3.0, 0.0),
        ];
        let mut buffer = original.clone();
        transform.forward(&mut buffer).unwrap();
        transform.inverse(&mut buffer).unwrap();

        for (out, expected) in buffer.iter().zip(original.iter()) {
            assert_abs_diff_eq!(out.re, expected.re * 4.0, epsilon = 1e-5);
            assert_abs_diff_eq!(out.im, expected.im * 4.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_buffer_size_mismatch() {
        let mut planner = RustFftPlanner::new();
        let mut transform = planner.plan(3).unwrap();

        let mut short = vec![Complex::new(0.0, 0.0); 4];
        assert_eq!(
            transform.forward(&mut short),
            Err(AudioError::BufferSizeMismatch)
        );
        assert_eq!(
            transform.inverse(&mut short),
            Err(AudioError::BufferSizeMismatch)
        );

        let mut input = vec![0.0; 8];
        let mut wrong_bins = vec![Complex::new(0.0, 0.0); 4];
        assert_eq!(
            transform.real_forward(&mut input, &mut wrong_bins),
            Err(AudioError::BufferSizeMismatch)
        );
        assert_eq!(
            transform.real_inverse(&mut wrong_bins, &mut input),
            Err(AudioError::BufferSizeMismatch)
        );
    }

    #[test]
    fn test_real_inverse_ignores_dc_and_nyquist_imaginary() {
        let mut planner = RustFftPlanner::new();
        let mut transform = planner.plan(2).unwrap();

        let mut spectrum = vec![
            Complex::new(4.0, 1.0),
            Complex::new(0.0, 0.0),
            Complex::new(0.0, -1.0),
        ];
        let mut output = vec![0.0; 4];
        transform.real_inverse(&mut spectrum, &mut output).unwrap();

        for sample in &output {
            assert_abs_diff_eq!(*sample, 4.0, epsilon = 1e-6);
        }
    }
}
