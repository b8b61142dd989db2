use thiserror::Error;

/// Errors that abort a run. Recoverable per-frame failures are reported as status values by the
/// pose, tracking and reconstruction stages instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
