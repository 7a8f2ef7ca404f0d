//! Error types for cadence.

use thiserror::Error;

/// Result type alias using cadence's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cadence operations.
///
/// Note that an allocation failing because no free block of the required
/// level exists is *not* an error: it is an expected outcome signalled by
/// `Option`, and the render side folds it into the next growth request.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction-time configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer descriptor could not be decoded.
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),
}
