//! Spectral filter representations
//!
//! A filter holds the partitioned spectrum of an impulse response and
//! multiplies one delay line slot against one of its partitions, adding the
//! product into the spectral accumulator. [`DenseFilter`] keeps every bin;
//! [`SparseFilter`] keeps only bins whose perceptually weighted level clears
//! a threshold.
//!
//! Both accumulate bin by bin in ascending order, and the engine calls them
//! partition by partition in delay line pairing order. With every bin
//! retained the two paths perform the same operations in the same order.

use crate::{
    amplitude_to_db, bin_frequency, AudioError, AudioResult, Bin, Partitions, Sample, Weighting,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-partition multiply-accumulate against a delay line slot.
pub trait SpectralFilter: Send {
    /// Number of partitions (`N`)
    fn partitions(&self) -> usize;

    /// Bins per partition (`B + 1`)
    fn bins(&self) -> usize;

    /// `accumulator[b] += spectrum[b] * filter[partition][b]` for the bins
    /// this filter stores.
    fn accumulate(&self, spectrum: &[Bin], partition: usize, accumulator: &mut [Bin]);

    /// Fraction of bins that take part in `accumulate` (1.0 for dense filters)
    fn density(&self) -> Sample {
        1.0
    }
}

/// Full per-bin representation of all partitions.
#[derive(Debug, Clone)]
pub struct DenseFilter {
    data: Vec<Bin>,
    partitions: usize,
    bins: usize,
}

impl DenseFilter {
    /// Copy the partitions of a filter channel
    pub fn new(filter: Partitions<'_>) -> Self {
        Self {
            data: filter.as_slice().to_vec(),
            partitions: filter.partitions(),
            bins: filter.bins(),
        }
    }
}

impl SpectralFilter for DenseFilter {
    fn partitions(&self) -> usize {
        self.partitions
    }

    fn bins(&self) -> usize {
        self.bins
    }

    #[inline]
    fn accumulate(&self, spectrum: &[Bin], partition: usize, accumulator: &mut [Bin]) {
        debug_assert_eq!(spectrum.len(), self.bins);
        debug_assert_eq!(accumulator.len(), self.bins);

        let start = partition * self.bins;
        let row = &self.data[start..start + self.bins];

        // Iterator form lets LLVM auto-vectorize the complex multiply-add
        for ((acc, &x), &h) in accumulator.iter_mut().zip(spectrum).zip(row) {
            *acc += x * h;
        }
    }
}

/// Pruning parameters for [`SparseFilter`].
///
/// # Example
///
/// ```rust
/// use upconv::{SparsityConfig, Weighting};
///
/// let config = SparsityConfig {
///     threshold_db: -60.0,
///     weighting: Weighting::A,
///     sample_rate: 44100.0,
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SparsityConfig {
    /// Bins whose weighted level is at or below this are dropped (dB relative
    /// to the loudest bin of the filter)
    pub threshold_db: Sample,
    /// Weighting curve added to each bin's level
    pub weighting: Weighting,
    /// Sample rate used to map bins to frequencies for the weighting curve
    pub sample_rate: Sample,
}

impl Default for SparsityConfig {
    fn default() -> Self {
        Self {
            threshold_db: -90.0,
            weighting: Weighting::Flat,
            sample_rate: 48000.0,
        }
    }
}

impl SparsityConfig {
    /// Configuration that keeps every bin
    pub fn retain_all() -> Self {
        Self {
            threshold_db: Sample::NEG_INFINITY,
            ..Self::default()
        }
    }

    /// Check the parameters
    ///
    /// # Errors
    /// - `InvalidThreshold` if the threshold is NaN or positive infinity
    /// - `InvalidSampleRate` if the sample rate is not positive and finite
    pub fn validate(&self) -> AudioResult<()> {
        if self.threshold_db.is_nan() || self.threshold_db == Sample::INFINITY {
            return Err(AudioError::InvalidThreshold);
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(AudioError::InvalidSampleRate);
        }
        Ok(())
    }
}

/// Pruned representation storing only perceptually significant bins.
///
/// Storage is compressed sparse rows: one row per partition, column indices
/// strictly increasing within a row.
#[derive(Debug, Clone)]
pub struct SparseFilter {
    values: Vec<Bin>,
    columns: Vec<usize>,
    /// `partitions + 1` offsets into `values`/`columns`
    row_offsets: Vec<usize>,
    bins: usize,
}

impl SparseFilter {
    /// Prune a filter channel
    ///
    /// The level of a bin is its magnitude relative to the loudest bin of the
    /// whole filter, in dB, plus the weighting at the bin's center frequency.
    /// A bin is kept when its level is strictly above `threshold_db`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use upconv::{uniform_partition, SparseFilter, SparsityConfig, SpectralFilter};
    ///
    /// let tensor = uniform_partition(&[vec![1.0f32, 0.5, 0.25]], 64).unwrap();
    /// let filter = SparseFilter::new(tensor.channel(0), &SparsityConfig::retain_all()).unwrap();
    /// assert_eq!(filter.retained(), 65);
    /// assert_eq!(filter.density(), 1.0);
    /// ```
    pub fn new(filter: Partitions<'_>, config: &SparsityConfig) -> AudioResult<Self> {
        config.validate()?;

        let bins = filter.bins();
        let transform_size = 2 * filter.block_size();

        let peak = filter
            .as_slice()
            .iter()
            .map(|bin| bin.norm())
            .fold(0.0, Sample::max);
        let scale = if peak > 0.0 { 1.0 / peak } else { 1.0 };

        let weights: Vec<Sample> = (0..bins)
            .map(|b| {
                config
                    .weighting
                    .weight(bin_frequency(b, transform_size, config.sample_rate))
            })
            .collect();
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(AudioError::InvalidWeighting);
        }

        let mut values = Vec::new();
        let mut columns = Vec::new();
        let mut row_offsets = Vec::with_capacity(filter.partitions() + 1);

        for partition in filter.iter() {
            row_offsets.push(values.len());
            for (b, (&value, &weight)) in partition.iter().zip(&weights).enumerate() {
                let level = amplitude_to_db(value.norm() * scale) + weight;
                if level > config.threshold_db {
                    values.push(value);
                    columns.push(b);
                }
            }
        }
        row_offsets.push(values.len());

        values.shrink_to_fit();
        columns.shrink_to_fit();

        let sparse = Self {
            values,
            columns,
            row_offsets,
            bins,
        };

        log::debug!(
            "SparseFilter: kept {} of {} bins ({:.2}%) at {} dB, {:?} weighting",
            sparse.retained(),
            filter.as_slice().len(),
            sparse.density() * 100.0,
            config.threshold_db,
            config.weighting
        );

        Ok(sparse)
    }

    /// Number of stored bins across all partitions
    pub fn retained(&self) -> usize {
        self.values.len()
    }

    /// Stored `(bin, value)` pairs of one partition, ascending by bin
    pub fn row(&self, partition: usize) -> impl Iterator<Item = (usize, Bin)> + '_ {
        let range = self.row_offsets[partition]..self.row_offsets[partition + 1];
        self.columns[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }
}

impl SpectralFilter for SparseFilter {
    fn partitions(&self) -> usize {
        self.row_offsets.len() - 1
    }

    fn bins(&self) -> usize {
        self.bins
    }

    #[inline]
    fn accumulate(&self, spectrum: &[Bin], partition: usize, accumulator: &mut [Bin]) {
        debug_assert_eq!(spectrum.len(), self.bins);
        debug_assert_eq!(accumulator.len(), self.bins);

        let range = self.row_offsets[partition]..self.row_offsets[partition + 1];
        for (&b, &h) in self.columns[range.clone()].iter().zip(&self.values[range]) {
            accumulator[b] += spectrum[b] * h;
        }
    }

    fn density(&self) -> Sample {
        let total = self.partitions() * self.bins;
        if total == 0 {
            return 0.0;
        }
        self.values.len() as Sample / total as Sample
    }
}

/// Filter representation chosen at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilterKind {
    /// Keep every bin
    #[default]
    Dense,
    /// Prune bins with the given parameters
    Sparse(SparsityConfig),
}

impl FilterKind {
    /// Build the filter for one channel
    pub fn build(&self, filter: Partitions<'_>) -> AudioResult<Box<dyn SpectralFilter>> {
        Ok(match self {
            FilterKind::Dense => Box::new(DenseFilter::new(filter)),
            FilterKind::Sparse(config) => Box::new(SparseFilter::new(filter, config)?),
        })
    }
}
