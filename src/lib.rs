#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![doc = include_str!("../README.md")]

pub mod convolve;
pub mod fdl;
pub mod filter;
pub mod overlap;
pub mod partition;
pub mod transform;
pub mod utils;
pub mod weighting;

pub use convolve::*;
pub use fdl::*;
pub use filter::*;
pub use overlap::*;
pub use partition::*;
pub use transform::*;
pub use utils::*;
pub use weighting::*;

pub use rustfft::num_complex::Complex;

/// Audio sample type (32-bit float).
pub type Sample = f32;

/// Buffer of audio samples.
pub type AudioBuffer = Vec<Sample>;

/// One frequency-domain coefficient.
pub type Bin = Complex<Sample>;

/// Convolution errors.
///
/// Contract violations (wrong buffer extents, bad block sizes, processing
/// before configuration) and configuration errors share this enum. Nothing
/// here is transient: retrying the same call yields the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    /// Block size must be a non-zero power of two.
    #[error("Invalid block size")]
    InvalidBlockSize,
    /// Transform order is zero or too large for the platform.
    #[error("Invalid transform order")]
    InvalidOrder,
    /// Not enough data provided for the requested operation.
    #[error("Insufficient data")]
    InsufficientData,
    /// Input buffer sizes do not match expected dimensions.
    #[error("Buffer size mismatch")]
    BufferSizeMismatch,
    /// `process` was called before a filter was configured.
    #[error("Convolver is not configured")]
    NotConfigured,
    /// Sparsity threshold is NaN or positive infinity.
    #[error("Invalid sparsity threshold")]
    InvalidThreshold,
    /// Sample rate must be positive and finite.
    #[error("Invalid sample rate")]
    InvalidSampleRate,
    /// Weighting curve produced a NaN or infinite offset.
    #[error("Invalid weighting curve")]
    InvalidWeighting,
    /// An error occurred during FFT processing.
    #[error("FFT processing error")]
    FftError,
}

impl From<realfft::FftError> for AudioError {
    fn from(_: realfft::FftError) -> Self {
        AudioError::FftError
    }
}

/// Result type for convolution operations
pub type AudioResult<T> = Result<T, AudioError>;
