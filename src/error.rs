/// Error types for arena setup and for failed stores.
use thiserror::Error;

/// Result type alias using the setup [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while creating or attaching to a shared buffer cache.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while creating or mapping the backing file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected configuration value
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// The arena cannot hold the header and the reserved entries margin
    #[error("arena of {size} bytes is too small, need at least {minimum}")]
    ArenaTooSmall { size: usize, minimum: usize },

    /// The mapped file does not start with the expected magic
    #[error("invalid shared buffer cache: bad magic")]
    BadMagic,

    /// The existing arena was created with a different layout
    #[error("shared buffer cache layout mismatch on {field}: expected {expected}, found {found}")]
    LayoutMismatch {
        field: &'static str,
        expected: u64,
        found: u64,
    },

    /// The creator hashes keys differently from this process
    #[error("shared buffer cache was created by a build with a different key hash")]
    HasherMismatch,
}

/// Why a store did not cache its value.
///
/// Every variant degrades to "value not cached"; the caller recomputes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The key is already present (allocated or ready)
    #[error("key already exists")]
    Exists,

    /// A crashed store left the cache dirty and the lockout window is still open
    #[error("cache is recovering from an interrupted store")]
    Recovering,

    /// The value can never fit, even in an empty cache
    #[error("value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    /// No free entry record and the oldest entry is pinned
    #[error("no free entry available")]
    NoFreeEntry,

    /// Not enough buffer space and the oldest entry is pinned
    #[error("no buffer space available")]
    NoBufferSpace,
}

impl StoreError {
    /// Whether the same store may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Recovering | StoreError::NoFreeEntry | StoreError::NoBufferSpace
        )
    }
}
