use std::path::PathBuf;

use thiserror::Error;

/// A list of possible errors returned by the page store.
#[derive(Error, Debug)]
pub enum Error {
    /// The page store has been disposed.
    #[error("Page store already disposed")]
    AlreadyDisposed,
    /// The requested page is not covered by the allocated pages.
    #[error("Invalid page number {page}, the store has {allocated} allocated pages")]
    InvalidPageNumber {
        /// The requested page number.
        page: u64,
        /// The number of pages the store (or generation) covers.
        allocated: u64,
    },
    /// A generation was used after its mapping had been released, or with a
    /// store that doesn't own it.
    #[error("Invalid mapping state of generation {0}")]
    InvalidMappingState(u64),
    /// The file can not grow because it is mapped copy-on-write.
    #[error("Cannot grow '{}' while it is mapped copy-on-write", .0.display())]
    WriteProtectedGrowth(PathBuf),
    /// Memory could not be locked, even after remediation.
    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),
    /// An error from the platform.
    #[error("IO {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type returned by the page store.
pub type Result<T, E = Error> = std::result::Result<T, E>;
