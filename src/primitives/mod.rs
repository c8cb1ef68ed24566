//! Layers below the trees: byte codecs, file access, locking, the log and
//! the pager.

/// Fixed-width and variable-length integer codecs and buffer cursors.
pub mod bytes;

/// Process registry, lock slots and shared memory.
pub mod concurrency;

/// File-system abstraction with OS-backed and in-memory implementations.
pub mod io;

/// Page cache, transaction levels and page/block allocation.
pub mod pager;

/// Write-ahead log with a shared-memory index.
pub mod wal;
