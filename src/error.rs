//! Crate-wide error type.
//!
//! Contract violations terminate the conversion; absent optional inputs
//! (missing imagery, missing RM texture) are handled as branches by the
//! callers and never reach this type.

use crate::dataset::Dataset;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tile arrived for a dataset the builder has no collection for.
    #[error("{0} is not currently supported")]
    UnsupportedDataset(Dataset),

    /// Bad converter configuration, e.g. a non-positive subtree depth.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A Morton bit index fell outside its availability buffer.
    #[error("x, y, level coordinates too large for given buffer")]
    OutOfRange,

    /// A combine request did not match `{DatasetName}_{CS1}_{CS2}`.
    #[error("malformed combine token: {0}")]
    MalformedCombineToken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
