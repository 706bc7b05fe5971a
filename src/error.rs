use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    /// Slice dimensions do not match the session, or the slice is not square.
    #[error("invalid size: {0}")]
    InvalidSize(String),
    /// The slice is in the wrong domain (real space vs Fourier space).
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("missing input: {0}")]
    NullInput(String),
    #[error("malformed data: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn invalid_size(m: impl Into<String>) -> ReconError {
    ReconError::InvalidSize(m.into())
}

pub fn invalid_state(m: impl Into<String>) -> ReconError {
    ReconError::InvalidState(m.into())
}

pub fn invalid_config(m: impl Into<String>) -> ReconError {
    ReconError::InvalidConfiguration(m.into())
}
