use thiserror::Error;

/// Result alias for fallible tree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by tree operations.
///
/// Internally these travel inside the walker's node word as encoded
/// sentinels so the write pipeline can propagate a failure without a
/// separate channel; they are decoded back at the public API boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A malformed request: inverted range, reserved value, or an
    /// allocation request that cannot fit in its window.
    #[error("invalid argument")]
    InvalidArgument,
    /// An insert hit a range that already holds a value.
    #[error("range already occupied")]
    Occupied,
    /// Node allocation failed in a non-blocking context.  The caller is
    /// expected to retry after a blocking refill of the reserve.
    #[error("node allocation failed")]
    NoMemory,
    /// No free range of the requested size exists in the search window.
    #[error("no fit for requested range")]
    NoFit,
}

impl Error {
    pub(crate) fn code(self) -> usize {
        match self {
            Error::InvalidArgument => 1,
            Error::Occupied => 2,
            Error::NoMemory => 3,
            Error::NoFit => 4,
        }
    }

    pub(crate) fn from_code(code: usize) -> Error {
        match code {
            1 => Error::InvalidArgument,
            2 => Error::Occupied,
            3 => Error::NoMemory,
            _ => Error::NoFit,
        }
    }
}
