#![forbid(unsafe_code)]
//! Shared identifiers, the crate error type, and checksum helpers.

pub mod checksum;

use std::fmt;

/// Page number inside the database file. Page 1 holds the database header.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageNo(pub u32);

impl PageNo {
    /// Sentinel meaning "no page".
    pub const NONE: PageNo = PageNo(0);
    /// Page holding the database header.
    pub const HEADER: PageNo = PageNo(1);

    /// Returns true for the "no page" sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this page in the database file.
    pub fn offset(self, page_size: usize) -> u64 {
        debug_assert!(self.0 > 0, "page numbers start at 1");
        u64::from(self.0 - 1) * page_size as u64
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum BtError {
    /// A lock could not be obtained; retrying the same call is safe.
    #[error("database is busy")]
    Busy,
    /// The write snapshot is no longer the newest committed state.
    #[error("snapshot is stale; restart the transaction")]
    BusySnapshot,
    /// A block or extent is exhausted. Handled internally by the fast-insert path.
    #[error("block full")]
    Full,
    /// A payload exceeds what the overflow encoding can address.
    #[error("payload too large")]
    TooBig,
    /// Checksum mismatch or malformed on-disk structure.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Page 1 of a non-empty file is not a valid header.
    #[error("file is not a database")]
    NotADatabase,
    /// Failure reported by the file-system layer.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Operation issued at the wrong transaction level or with bad arguments.
    #[error("misuse: {0}")]
    Misuse(&'static str),
    /// Requested entry does not exist.
    #[error("not found")]
    NotFound,
}

impl BtError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BtError::Busy | BtError::BusySnapshot)
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, BtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offsets_are_one_based() {
        assert_eq!(PageNo(1).offset(4096), 0);
        assert_eq!(PageNo(3).offset(1024), 2048);
        assert!(PageNo::NONE.is_none());
    }

    #[test]
    fn only_contention_is_retryable() {
        assert!(BtError::Busy.is_retryable());
        assert!(BtError::BusySnapshot.is_retryable());
        assert!(!BtError::Corruption("x").is_retryable());
        assert!(!BtError::Full.is_retryable());
    }
}
