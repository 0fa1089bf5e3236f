//! Uniform partitioned convolution for real-time audio processing
//!
//! [`Convolver`] is the composition root: it owns a frequency delay line, a
//! dense or sparse filter, and an overlap reconstructor, and turns one block
//! of `B` input samples into `B` output samples per call with bounded cost,
//! however long the impulse response is.
//!
//! `configure` is the only call that allocates. `process` never allocates,
//! locks or logs, and must see blocks in strict temporal order.
//!
//! The module also carries two reference convolutions ([`fft_convolve`] and
//! [`time_convolve`]) used to validate the partitioned engine.

use crate::{
    utils::{ilog2, next_power_of_two},
    uniform_partition_with, AudioBuffer, AudioError, AudioResult, Bin, DelayLine, DelayLineKind,
    FilterKind, Overlap, OverlapMode, PartitionTensor, Partitions, RustFftPlanner, Sample,
    SpectralFilter, TransformPlanner,
};
use rustfft::num_complex::Complex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for a [`Convolver`]
///
/// # Example
///
/// ```rust
/// use upconv::{
///     ConvolverConfig, DelayLineKind, FilterKind, OverlapMode, SparsityConfig, Weighting,
/// };
///
/// let config = ConvolverConfig {
///     overlap: OverlapMode::Add,
///     filter: FilterKind::Sparse(SparsityConfig {
///         threshold_db: -70.0,
///         weighting: Weighting::A,
///         sample_rate: 48000.0,
///     }),
///     delay_line: DelayLineKind::Compressed,
/// };
/// assert_ne!(config, ConvolverConfig::default());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvolverConfig {
    /// Block reconstruction strategy
    pub overlap: OverlapMode,
    /// Dense or sparse filter representation
    pub filter: FilterKind,
    /// Full-precision or 16-bit input spectrum storage
    pub delay_line: DelayLineKind,
}

/// Everything `configure` builds and `process` mutates
struct Engine {
    overlap: Box<dyn Overlap>,
    fdl: Box<dyn DelayLine>,
    filter: Box<dyn SpectralFilter>,
    /// Spectral accumulator, overwritten every block
    accumulator: Vec<Bin>,
}

impl Engine {
    fn process(&mut self, block: &mut [Sample]) -> AudioResult<()> {
        let Self {
            overlap,
            fdl,
            filter,
            accumulator,
        } = self;

        overlap.process(block, &mut |spectrum: &mut [Bin]| {
            accumulator.fill(Complex::new(0.0, 0.0));
            fdl.push(spectrum, &mut |slot: &[Bin], partition: usize| {
                filter.accumulate(slot, partition, &mut accumulator[..]);
            });
            spectrum.copy_from_slice(&accumulator[..]);
        })
    }

    fn reset(&mut self) {
        self.fdl.reset();
        self.overlap.reset();
        self.accumulator.fill(Complex::new(0.0, 0.0));
    }
}

/// Uniform partitioned convolution engine
///
/// One instance processes one audio channel. Instances share no state and
/// can run on separate threads.
///
/// # Example
///
/// ```rust
/// use upconv::{uniform_partition, Convolver, ConvolverConfig};
///
/// let impulse_response = vec![vec![0.5f32, 0.3, 0.1]];
/// let tensor = uniform_partition(&impulse_response, 512).unwrap();
///
/// let mut convolver = Convolver::new(ConvolverConfig::default());
/// convolver.configure(tensor.channel(0)).unwrap();
///
/// let mut block = vec![1.0; 512];
/// convolver.process(&mut block).unwrap();
/// assert!((block[0] - 0.5).abs() < 1e-5);
/// assert!((block[2] - 0.9).abs() < 1e-5);
/// ```
pub struct Convolver {
    config: ConvolverConfig,
    planner: Box<dyn TransformPlanner>,
    engine: Option<Engine>,
}

impl Convolver {
    /// Create an unconfigured convolver using the rustfft backend
    pub fn new(config: ConvolverConfig) -> Self {
        Self::with_planner(config, RustFftPlanner::new())
    }

    /// Create an unconfigured convolver with a custom transform backend
    pub fn with_planner(config: ConvolverConfig, planner: impl TransformPlanner + 'static) -> Self {
        Self {
            config,
            planner: Box::new(planner),
            engine: None,
        }
    }

    /// Partition `impulse_response` and configure a convolver in one step
    ///
    /// # Example
    ///
    /// ```rust
    /// use upconv::{Convolver, ConvolverConfig};
    ///
    /// let mut convolver =
    ///     Convolver::from_impulse(&[1.0, 0.5], 4, ConvolverConfig::default()).unwrap();
    /// let mut block = vec![1.0, 0.0, 0.0, 0.0];
    /// convolver.process(&mut block).unwrap();
    /// assert!((block[1] - 0.5).abs() < 1e-6);
    /// ```
    pub fn from_impulse(
        impulse_response: &[Sample],
        block_size: usize,
        config: ConvolverConfig,
    ) -> AudioResult<Self> {
        let mut convolver = Self::new(config);
        let tensor =
            uniform_partition_with(&[impulse_response], block_size, &mut *convolver.planner)?;
        convolver.configure(tensor.channel(0))?;
        Ok(convolver)
    }

    /// Current configuration
    pub fn config(&self) -> &ConvolverConfig {
        &self.config
    }

    /// Install a new filter
    ///
    /// Block size and partition count are taken from the filter. All state
    /// is rebuilt and the delay line cursor rewinds to 0. If anything fails
    /// the previously installed filter stays active.
    ///
    /// # Errors
    /// - `InvalidBlockSize` / `InvalidOrder` for unusable filter extents
    /// - `InvalidThreshold` / `InvalidSampleRate` / `InvalidWeighting` for bad
    ///   sparsity settings
    pub fn configure(&mut self, filter: Partitions<'_>) -> AudioResult<()> {
        let block_size = filter.block_size();
        let order = ilog2(block_size)? + 1;

        let transform = self.planner.plan(order)?;
        let overlap = self.config.overlap.build(block_size, transform)?;
        let spectral_filter = self.config.filter.build(filter)?;

        let engine = Engine {
            overlap,
            fdl: self
                .config
                .delay_line
                .build(filter.partitions(), filter.bins()),
            filter: spectral_filter,
            accumulator: vec![Complex::new(0.0, 0.0); filter.bins()],
        };

        log::debug!(
            "Convolver: configured {} partitions of {} samples, {:?}, {:?} delay line, density {:.3}",
            filter.partitions(),
            block_size,
            self.config.overlap,
            self.config.delay_line,
            engine.filter.density()
        );

        self.engine = Some(engine);
        Ok(())
    }

    /// Replace the configuration and install a new filter
    ///
    /// On failure both the previous configuration and filter are kept.
    pub fn configure_with(
        &mut self,
        config: ConvolverConfig,
        filter: Partitions<'_>,
    ) -> AudioResult<()> {
        let previous = core::mem::replace(&mut self.config, config);
        let result = self.configure(filter);
        if result.is_err() {
            self.config = previous;
        }
        result
    }

    /// Convolve one block in place
    ///
    /// # Errors
    /// - `NotConfigured` if no filter has been installed
    /// - `BufferSizeMismatch` if `block.len()` differs from the block size
    pub fn process(&mut self, block: &mut [Sample]) -> AudioResult<()> {
        self.engine
            .as_mut()
            .ok_or(AudioError::NotConfigured)?
            .process(block)
    }

    /// Convolve one block into a separate output buffer
    pub fn process_into(&mut self, input: &[Sample], output: &mut [Sample]) -> AudioResult<()> {
        if input.len() != output.len() {
            return Err(AudioError::BufferSizeMismatch);
        }
        output.copy_from_slice(input);
        self.process(output)
    }

    /// Reset the processor state
    ///
    /// Clears the delay line, its cursor and the overlap state. The filter
    /// stays installed. Use this when starting a new audio stream.
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    /// Whether a filter is installed
    pub fn is_configured(&self) -> bool {
        self.engine.is_some()
    }

    /// Block size `B`, if configured
    pub fn block_size(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.overlap.block_size())
    }

    /// Number of filter partitions `N`, if configured
    pub fn partitions(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.fdl.len())
    }

    /// Input-to-output latency in samples, if configured
    ///
    /// Each call returns the output for the block it was given, so the only
    /// latency is the one block the caller buffers before calling.
    pub fn latency(&self) -> Option<usize> {
        self.block_size()
    }

    /// Slot the next block's spectrum will be written to, if configured
    pub fn write_pos(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.fdl.write_pos())
    }

    /// Fraction of filter bins in use (1.0 for dense filters)
    pub fn filter_density(&self) -> Option<Sample> {
        self.engine.as_ref().map(|e| e.filter.density())
    }

    /// The frequency delay line, if configured
    pub fn fdl(&self) -> Option<&dyn DelayLine> {
        self.engine.as_ref().map(|e| e.fdl.as_ref())
    }
}

/// Multi-channel convolution processor
///
/// Runs one [`Convolver`] per channel of a [`PartitionTensor`]. Channels are
/// independent: channel `c` of the input is convolved with channel `c` of
/// the filter.
///
/// # Example
///
/// ```rust
/// use upconv::{uniform_partition, ConvolverConfig, MultiChannelConvolver};
///
/// let tensor = uniform_partition(&[vec![1.0f32, 0.5], vec![0.8, 0.4]], 4).unwrap();
/// let mut stereo = MultiChannelConvolver::new(&tensor, ConvolverConfig::default()).unwrap();
///
/// let mut left = vec![1.0, 0.0, 0.0, 0.0];
/// let mut right = vec![0.5, 0.0, 0.0, 0.0];
/// stereo.process(&mut [&mut left[..], &mut right[..]]).unwrap();
/// assert!((right[0] - 0.4).abs() < 1e-6);
///
/// // Or process interleaved audio in place
/// let mut interleaved = vec![1.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
/// stereo.process_interleaved(&mut interleaved).unwrap();
/// ```
pub struct MultiChannelConvolver {
    channels: Vec<Convolver>,
    block_size: usize,
    /// Deinterleaving scratch, one block
    scratch: AudioBuffer,
}

impl MultiChannelConvolver {
    /// Configure one convolver per filter channel
    pub fn new(filter: &PartitionTensor, config: ConvolverConfig) -> AudioResult<Self> {
        let channels = filter
            .iter()
            .map(|partitions| {
                let mut convolver = Convolver::new(config);
                convolver.configure(partitions)?;
                Ok(convolver)
            })
            .collect::<AudioResult<Vec<_>>>()?;

        Ok(Self {
            channels,
            block_size: filter.block_size(),
            scratch: vec![0.0; filter.block_size()],
        })
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Get the configured block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Per-channel convolvers, e.g. to hand them to separate threads
    pub fn convolvers_mut(&mut self) -> &mut [Convolver] {
        &mut self.channels
    }

    /// Process one block per channel in place
    ///
    /// # Errors
    /// Returns `BufferSizeMismatch` if the channel count or any block length
    /// is wrong; no channel is processed in that case.
    pub fn process(&mut self, blocks: &mut [&mut [Sample]]) -> AudioResult<()> {
        if blocks.len() != self.channels.len()
            || blocks.iter().any(|block| block.len() != self.block_size)
        {
            return Err(AudioError::BufferSizeMismatch);
        }

        for (convolver, block) in self.channels.iter_mut().zip(blocks.iter_mut()) {
            convolver.process(block)?;
        }
        Ok(())
    }

    /// Process interleaved audio (`c0, c1, .., c0, c1, ..`) in place
    ///
    /// # Arguments
    /// * `interleaved` - Interleaved samples (length must be `channels * block_size`)
    pub fn process_interleaved(&mut self, interleaved: &mut [Sample]) -> AudioResult<()> {
        let num_channels = self.channels.len();
        if interleaved.len() != self.block_size * num_channels {
            return Err(AudioError::BufferSizeMismatch);
        }

        for (ch, convolver) in self.channels.iter_mut().enumerate() {
            for (sample, frame) in self
                .scratch
                .iter_mut()
                .zip(interleaved.chunks_exact(num_channels))
            {
                *sample = frame[ch];
            }

            convolver.process(&mut self.scratch)?;

            for (frame, &sample) in interleaved
                .chunks_exact_mut(num_channels)
                .zip(self.scratch.iter())
            {
                frame[ch] = sample;
            }
        }
        Ok(())
    }

    /// Reset all channel processors
    pub fn reset(&mut self) {
        for convolver in &mut self.channels {
            convolver.reset();
        }
    }
}

/// Perform FFT-based convolution
///
/// Single-transform reference convolution, not suitable for streaming.
/// Output length is `signal.len() + kernel.len() - 1`.
///
/// # Example
///
/// ```rust
/// use upconv::fft_convolve;
///
/// let signal = vec![1.0, 2.0, 3.0, 4.0];
/// let kernel = vec![0.5, 0.3, 0.1];
/// let result = fft_convolve(&signal, &kernel).unwrap();
/// assert_eq!(result.len(), 6);
/// ```
pub fn fft_convolve(signal: &[Sample], kernel: &[Sample]) -> AudioResult<AudioBuffer> {
    if signal.is_empty() || kernel.is_empty() {
        return Err(AudioError::InsufficientData);
    }

    let output_length = signal.len() + kernel.len() - 1;
    let fft_size = next_power_of_two(output_length).max(2);
    let mut transform = RustFftPlanner::new().plan(ilog2(fft_size)?)?;

    let mut signal_buffer = vec![0.0; fft_size];
    signal_buffer[..signal.len()].copy_from_slice(signal);
    let mut kernel_buffer = vec![0.0; fft_size];
    kernel_buffer[..kernel.len()].copy_from_slice(kernel);

    let mut signal_spectrum = vec![Complex::new(0.0, 0.0); transform.bins()];
    let mut kernel_spectrum = signal_spectrum.clone();
    transform.real_forward(&mut signal_buffer, &mut signal_spectrum)?;
    transform.real_forward(&mut kernel_buffer, &mut kernel_spectrum)?;

    for (sig, &ker) in signal_spectrum.iter_mut().zip(&kernel_spectrum) {
        *sig *= ker;
    }

    transform.real_inverse(&mut signal_spectrum, &mut signal_buffer)?;

    let scale = 1.0 / fft_size as Sample;
    Ok(signal_buffer
        .iter()
        .take(output_length)
        .map(|&x| x * scale)
        .collect())
}

/// Perform time-domain convolution (for comparison/validation)
///
/// Direct O(n·m) implementation. Output length is
/// `signal.len() + kernel.len() - 1`.
///
/// # Example
///
/// ```rust
/// use upconv::time_convolve;
///
/// let result = time_convolve(&[1.0, 2.0], &[0.5, 0.25]).unwrap();
/// assert_eq!(result, vec![0.5, 1.25, 0.5]);
/// ```
pub fn time_convolve(signal: &[Sample], kernel: &[Sample]) -> AudioResult<AudioBuffer> {
    if signal.is_empty() || kernel.is_empty() {
        return Err(AudioError::InsufficientData);
    }

    let output_length = signal.len() + kernel.len() - 1;
    let mut output = vec![0.0; output_length];

    for (i, &sig_sample) in signal.iter().enumerate() {
        for (j, &kernel_sample) in kernel.iter().enumerate() {
            output[i + j] += sig_sample * kernel_sample;
        }
    }

    Ok(output)
}
