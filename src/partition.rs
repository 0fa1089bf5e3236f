//! Uniform partitioning of impulse responses
//!
//! An impulse response is cut into consecutive segments of `B` samples. Each
//! segment is zero-padded to `2B`, transformed, and scaled by `1 / (2B)`, so
//! the inverse transforms in the reconstructors need no further scaling.

use crate::{
    utils::ilog2, AudioError, AudioResult, Bin, RustFftPlanner, Sample, TransformPlanner,
};
use rustfft::num_complex::Complex;

/// Spectral partitions of a multi-channel filter, `[channel][partition][bin]`.
///
/// `bins` is `B + 1` where `B` is the block size the filter was partitioned
/// with. The tensor is stored as one contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTensor {
    data: Vec<Bin>,
    channels: usize,
    partitions: usize,
    bins: usize,
}

impl PartitionTensor {
    /// Create a zero-filled tensor
    ///
    /// `bins - 1` must be a non-zero power of two and `channels` and
    /// `partitions` must be non-zero.
    pub fn zeros(channels: usize, partitions: usize, bins: usize) -> AudioResult<Self> {
        validate_bins(bins)?;
        if channels == 0 || partitions == 0 {
            return Err(AudioError::InsufficientData);
        }
        Ok(Self {
            data: vec![Complex::new(0.0, 0.0); channels * partitions * bins],
            channels,
            partitions,
            bins,
        })
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of partitions per channel
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of bins per partition (`B + 1`)
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Block size the filter was partitioned with
    pub fn block_size(&self) -> usize {
        self.bins - 1
    }

    /// The `[partition][bin]` matrix of one channel
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels()`.
    pub fn channel(&self, channel: usize) -> Partitions<'_> {
        let stride = self.partitions * self.bins;
        let start = channel * stride;
        Partitions {
            data: &self.data[start..start + stride],
            partitions: self.partitions,
            bins: self.bins,
        }
    }

    /// Iterate over all channels
    pub fn iter(&self) -> impl Iterator<Item = Partitions<'_>> + '_ {
        (0..self.channels).map(move |ch| self.channel(ch))
    }

    /// Spectrum of one partition
    pub fn partition(&self, channel: usize, partition: usize) -> &[Bin] {
        let start = self.offset(channel, partition);
        &self.data[start..start + self.bins]
    }

    /// Mutable spectrum of one partition
    pub fn partition_mut(&mut self, channel: usize, partition: usize) -> &mut [Bin] {
        let start = self.offset(channel, partition);
        &mut self.data[start..start + self.bins]
    }

    fn offset(&self, channel: usize, partition: usize) -> usize {
        assert!(channel < self.channels && partition < self.partitions);
        (channel * self.partitions + partition) * self.bins
    }
}

/// Borrowed `[partition][bin]` view of a single filter channel.
///
/// This is what [`Convolver::configure`](crate::Convolver::configure) consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Partitions<'a> {
    data: &'a [Bin],
    partitions: usize,
    bins: usize,
}

impl<'a> Partitions<'a> {
    /// Wrap a row-major `[partition][bin]` slice
    ///
    /// # Errors
    /// - `InvalidBlockSize` if `bins - 1` is not a non-zero power of two
    /// - `InsufficientData` if there are no partitions
    /// - `BufferSizeMismatch` if `data.len() != partitions * bins`
    pub fn new(data: &'a [Bin], partitions: usize, bins: usize) -> AudioResult<Self> {
        validate_bins(bins)?;
        if partitions == 0 {
            return Err(AudioError::InsufficientData);
        }
        if data.len() != partitions * bins {
            return Err(AudioError::BufferSizeMismatch);
        }
        Ok(Self {
            data,
            partitions,
            bins,
        })
    }

    /// Number of partitions (`N`)
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of bins per partition (`B + 1`)
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Block size (`B`)
    pub fn block_size(&self) -> usize {
        self.bins - 1
    }

    /// Spectrum of partition `index`
    pub fn partition(&self, index: usize) -> &'a [Bin] {
        let start = index * self.bins;
        &self.data[start..start + self.bins]
    }

    /// Iterate over partitions in time-lag order
    pub fn iter(&self) -> core::slice::ChunksExact<'a, Bin> {
        self.data.chunks_exact(self.bins)
    }

    /// The whole matrix as a flat row-major slice
    pub fn as_slice(&self) -> &'a [Bin] {
        self.data
    }
}

fn validate_bins(bins: usize) -> AudioResult<()> {
    if bins < 2 || !(bins - 1).is_power_of_two() {
        return Err(AudioError::InvalidBlockSize);
    }
    Ok(())
}

/// Partition a multi-channel impulse response with the default FFT backend
///
/// # Arguments
/// * `impulse` - Impulse response, one buffer per channel
/// * `block_size` - Partition length `B` (a power of two)
///
/// # Example
///
/// ```rust
/// use upconv::uniform_partition;
///
/// let impulse = vec![vec![0.0f32; 1000]];
/// let tensor = uniform_partition(&impulse, 256).unwrap();
/// assert_eq!(tensor.channels(), 1);
/// assert_eq!(tensor.partitions(), 4);
/// assert_eq!(tensor.bins(), 257);
/// ```
pub fn uniform_partition<C: AsRef<[Sample]>>(
    impulse: &[C],
    block_size: usize,
) -> AudioResult<PartitionTensor> {
    uniform_partition_with(impulse, block_size, &mut RustFftPlanner::new())
}

/// Partition a multi-channel impulse response with a caller-supplied backend
///
/// Channels shorter than the longest one are zero-extended, so every
/// channel has `ceil(longest / block_size)` partitions.
///
/// # Errors
/// - `InvalidBlockSize` if `block_size` is zero or not a power of two
/// - `InsufficientData` if there are no channels or all channels are empty
pub fn uniform_partition_with<C: AsRef<[Sample]>>(
    impulse: &[C],
    block_size: usize,
    planner: &mut dyn TransformPlanner,
) -> AudioResult<PartitionTensor> {
    let order = ilog2(block_size)? + 1;

    let length = impulse
        .iter()
        .map(|channel| channel.as_ref().len())
        .max()
        .unwrap_or(0);
    if length == 0 {
        return Err(AudioError::InsufficientData);
    }

    let mut transform = planner.plan(order)?;
    let transform_size = transform.len();
    let scale = 1.0 / transform_size as Sample;

    let partitions = length.div_ceil(block_size);
    let mut tensor = PartitionTensor::zeros(impulse.len(), partitions, block_size + 1)?;

    let mut window = vec![0.0; transform_size];
    for (ch, channel) in impulse.iter().enumerate() {
        let samples = channel.as_ref();
        for p in 0..partitions {
            let start = (p * block_size).min(samples.len());
            let end = (start + block_size).min(samples.len());

            window.fill(0.0);
            window[..end - start].copy_from_slice(&samples[start..end]);

            let spectrum = tensor.partition_mut(ch, p);
            transform.real_forward(&mut window, spectrum)?;
            for bin in spectrum.iter_mut() {
                *bin *= scale;
            }
        }
    }

    log::debug!(
        "uniform_partition: {} channel(s), {} samples -> {} partitions of {} samples",
        impulse.len(),
        length,
        partitions,
        block_size
    );

    Ok(tensor)
}
