//! Leaf cells and their on-page encoding.
//!
//! Leaf cell layout, tag first:
//!
//! ```text
//! inline     [1][klen varint][key][vlen varint][value]
//! tombstone  [2][klen varint][key]
//! overflow   [3][klen varint][key][vlen varint][local varint][local bytes]
//!            [ndirect u8][direct u32 * ndirect][tree root u32][tree depth u8]
//! ```
//!
//! Keys are always stored whole; an overflow cell keeps a prefix of the
//! value locally and the rest on overflow pages.

use crate::primitives::bytes::buf::{Reader, Writer};
use crate::primitives::bytes::var;
use crate::types::{BtError, PageNo, Result};

const TAG_INLINE: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;
const TAG_OVERFLOW: u8 = 3;

/// Bytes at the start of every node page.
pub const NODE_HEADER_LEN: usize = 8;
/// Overflow pages addressed straight from the cell.
pub const MAX_DIRECT: usize = 16;
/// Deepest pointer tree an overflow cell may use.
pub const MAX_TREE_DEPTH: u8 = 3;

/// Bytes available for cells on a node page.
pub fn usable(page_size: usize) -> usize {
    page_size - NODE_HEADER_LEN
}

/// Longest key a tree accepts.
pub fn max_key_len(page_size: usize) -> usize {
    usable(page_size) / 8
}

/// Largest encoded leaf cell; every node holds at least three.
pub fn max_local(page_size: usize) -> usize {
    usable(page_size) / 3
}

/// Overflow pages behind one cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverflowPages {
    /// First data pages, in order.
    pub direct: Vec<PageNo>,
    /// Root of the pointer tree holding the remaining data pages.
    pub tree: PageNo,
    /// Pointer-tree depth; zero when there is no tree.
    pub depth: u8,
}

/// One leaf entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cell {
    /// Key and value stored on the leaf.
    Inline {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Delete marker, only found in fast-insert trees.
    Tombstone {
        /// Deleted key.
        key: Vec<u8>,
    },
    /// Key and a value prefix stored on the leaf, the rest on overflow pages.
    Overflow {
        /// Key bytes.
        key: Vec<u8>,
        /// Full value length.
        value_len: u64,
        /// Leading value bytes kept on the leaf.
        local: Vec<u8>,
        /// Where the remaining bytes live.
        pages: OverflowPages,
    },
}

impl Cell {
    /// Key of the entry.
    pub fn key(&self) -> &[u8] {
        match self {
            Cell::Inline { key, .. } | Cell::Tombstone { key } | Cell::Overflow { key, .. } => key,
        }
    }

    /// True for delete markers.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Cell::Tombstone { .. })
    }

    /// Full value length; zero for delete markers.
    pub fn value_len(&self) -> u64 {
        match self {
            Cell::Inline { value, .. } => value.len() as u64,
            Cell::Tombstone { .. } => 0,
            Cell::Overflow { value_len, .. } => *value_len,
        }
    }

    /// Encoded size on a leaf.
    pub fn encoded_len(&self) -> usize {
        let key = self.key();
        let head = 1 + var::encoded_len(key.len() as u64) + key.len();
        match self {
            Cell::Inline { value, .. } => head + var::encoded_len(value.len() as u64) + value.len(),
            Cell::Tombstone { .. } => head,
            Cell::Overflow {
                value_len,
                local,
                pages,
                ..
            } => {
                head + var::encoded_len(*value_len)
                    + var::encoded_len(local.len() as u64)
                    + local.len()
                    + 1
                    + 4 * pages.direct.len()
                    + 5
            }
        }
    }

    /// Appends the encoding to `out`.
    pub fn encode(&self, out: &mut Writer) {
        match self {
            Cell::Inline { key, value } => {
                out.u8(TAG_INLINE).blob(key).blob(value);
            }
            Cell::Tombstone { key } => {
                out.u8(TAG_TOMBSTONE).blob(key);
            }
            Cell::Overflow {
                key,
                value_len,
                local,
                pages,
            } => {
                out.u8(TAG_OVERFLOW)
                    .blob(key)
                    .varint(*value_len)
                    .blob(local)
                    .u8(pages.direct.len() as u8);
                for pgno in &pages.direct {
                    out.u32(pgno.0);
                }
                out.u32(pages.tree.0).u8(pages.depth);
            }
        }
    }

    /// Decodes one cell.
    pub fn decode(src: &mut Reader<'_>) -> Result<Cell> {
        let tag = src.u8()?;
        let key = src.blob()?.to_vec();
        match tag {
            TAG_INLINE => Ok(Cell::Inline {
                key,
                value: src.blob()?.to_vec(),
            }),
            TAG_TOMBSTONE => Ok(Cell::Tombstone { key }),
            TAG_OVERFLOW => {
                let value_len = src.varint()?;
                let local = src.blob()?.to_vec();
                let n = src.u8()? as usize;
                if n > MAX_DIRECT || local.len() as u64 > value_len {
                    return Err(BtError::Corruption("overflow cell"));
                }
                let direct = (0..n).map(|_| src.u32().map(PageNo)).collect::<Result<Vec<_>>>()?;
                let tree = PageNo(src.u32()?);
                let depth = src.u8()?;
                if depth > MAX_TREE_DEPTH || (depth == 0) != tree.is_none() {
                    return Err(BtError::Corruption("overflow pointer tree"));
                }
                Ok(Cell::Overflow {
                    key,
                    value_len,
                    local,
                    pages: OverflowPages { direct, tree, depth },
                })
            }
            _ => Err(BtError::Corruption("leaf cell tag")),
        }
    }
}

/// Encoded size of an internal-node entry holding `key`.
pub fn internal_cell_len(key: &[u8]) -> usize {
    var::encoded_len(key.len() as u64) + key.len() + 4
}

/// Bytes of an overflow cell for `key` that are not local value bytes,
/// assuming the largest direct-pointer array.
pub fn overflow_overhead(key: &[u8], value_len: u64, page_size: usize) -> usize {
    1 + var::encoded_len(key.len() as u64)
        + key.len()
        + var::encoded_len(value_len)
        + var::encoded_len(max_local(page_size) as u64)
        + 1
        + 4 * MAX_DIRECT
        + 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_decode_to_what_was_encoded() -> Result<()> {
        let cells = vec![
            Cell::Inline {
                key: b"k".to_vec(),
                value: b"v".repeat(40),
            },
            Cell::Tombstone { key: b"gone".to_vec() },
            Cell::Overflow {
                key: b"big".to_vec(),
                value_len: 10_000,
                local: vec![7; 20],
                pages: OverflowPages {
                    direct: vec![PageNo(9), PageNo(10)],
                    tree: PageNo(11),
                    depth: 1,
                },
            },
        ];
        let mut w = Writer::new();
        for cell in &cells {
            cell.encode(&mut w);
        }
        let bytes = w.finish();
        assert_eq!(bytes.len(), cells.iter().map(Cell::encoded_len).sum::<usize>());
        let mut r = Reader::new(&bytes, "leaf cell");
        for cell in &cells {
            assert_eq!(&Cell::decode(&mut r)?, cell);
        }
        assert_eq!(r.remaining(), 0);
        Ok(())
    }

    #[test]
    fn bad_tag_is_corruption() {
        let mut r = Reader::new(&[9, 1, b'a'], "leaf cell");
        assert!(matches!(Cell::decode(&mut r), Err(BtError::Corruption(_))));
    }

    #[test]
    fn overflow_cell_always_fits_the_local_budget() {
        for ps in [512usize, 4096, 65536] {
            let key = vec![1u8; max_key_len(ps)];
            assert!(overflow_overhead(&key, u64::MAX, ps) < max_local(ps));
        }
    }
}
