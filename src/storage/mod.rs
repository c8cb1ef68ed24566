//! Trees and the fast-insert levels built on the pager.

/// Paged B-trees: nodes, overflow chains, balancing and cursors.
pub mod btree;

/// Fast-insert levels and their merges.
pub mod fastinsert;

/// Page accounting across trees, levels and free lists.
pub mod verify;

pub use verify::{audit, PageAudit};
