//! `bt`: a transactional key-value store built on a paged B-tree.
//!
//! Writes go to a write-ahead log shared by every connection to the file;
//! checkpoints copy logged pages back into the database. Besides the main
//! tree, a database carries fast-insert levels: small trees confined to a
//! block each, merged in the background into larger ones.
//!
//! ```no_run
//! use bt::{Db, Target};
//!
//! # fn main() -> bt::Result<()> {
//! let mut db = Db::open_default("example.db")?;
//! db.replace(b"key", Some(b"value"), Target::Main)?;
//! assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
//! db.close()
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Cursor, Db, DbOptions, DbStats, SeekMode, SeekResult, Target};
pub use primitives::concurrency::Registry;
pub use primitives::io::{FileIo, MemVfs, StdVfs, Vfs};
pub use primitives::wal::Safety;
pub use storage::fastinsert::MergeReport;
pub use storage::PageAudit;
pub use types::{BtError, PageNo, Result};
