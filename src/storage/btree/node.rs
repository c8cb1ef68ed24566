//! Node pages.
//!
//! Header: `[kind u8][0 u8][ncell u16][right child u32]`, followed by the
//! cells packed back to back. Internal cells are `[klen varint][key][child u32]`;
//! keys in `children[i]` sort below `keys[i]`, keys in `children[i + 1]` at or
//! above it. A zeroed page reads as an empty leaf, so freshly allocated roots
//! need no initialisation.

use crate::primitives::bytes::buf::{Reader, Writer};
use crate::primitives::bytes::ord;
use crate::types::{BtError, PageNo, Result};

use super::cell::{internal_cell_len, usable, Cell, NODE_HEADER_LEN};

const KIND_EMPTY: u8 = 0;
const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;

/// Decoded node page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Leaf holding entries in key order.
    Leaf(Vec<Cell>),
    /// Internal node; `children.len() == keys.len() + 1`.
    Internal {
        /// Separator keys.
        keys: Vec<Vec<u8>>,
        /// Child pages.
        children: Vec<PageNo>,
    },
}

impl Node {
    /// Empty leaf.
    pub fn empty_leaf() -> Node {
        Node::Leaf(Vec::new())
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Bytes the cells take, excluding the page header.
    pub fn content_len(&self) -> usize {
        match self {
            Node::Leaf(cells) => cells.iter().map(Cell::encoded_len).sum(),
            Node::Internal { keys, .. } => keys.iter().map(|k| internal_cell_len(k)).sum(),
        }
    }

    /// True when the node fits on a page of `page_size` bytes.
    pub fn fits(&self, page_size: usize) -> bool {
        self.content_len() <= usable(page_size)
    }

    /// Parses a node page.
    pub fn decode(page: &[u8]) -> Result<Node> {
        let kind = page[0];
        let ncell = ord::get_u16(page, 2) as usize;
        let right = PageNo(ord::get_u32(page, 4));
        let mut src = Reader::new(&page[NODE_HEADER_LEN..], "node page");
        match kind {
            KIND_EMPTY if ncell == 0 && right.is_none() => Ok(Node::empty_leaf()),
            KIND_LEAF => {
                let cells = (0..ncell)
                    .map(|_| Cell::decode(&mut src))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::Leaf(cells))
            }
            KIND_INTERNAL => {
                if right.is_none() {
                    return Err(BtError::Corruption("internal node without right child"));
                }
                let mut keys = Vec::with_capacity(ncell);
                let mut children = Vec::with_capacity(ncell + 1);
                for _ in 0..ncell {
                    keys.push(src.blob()?.to_vec());
                    children.push(PageNo(src.u32()?));
                }
                children.push(right);
                Ok(Node::Internal { keys, children })
            }
            _ => Err(BtError::Corruption("node kind")),
        }
    }

    /// Serialises into a full page image.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(BtError::Corruption("node overflows its page"));
        }
        let mut out = Writer::with_capacity(page_size);
        match self {
            Node::Leaf(cells) => {
                out.u8(KIND_LEAF).u8(0).u16(cells.len() as u16).u32(0);
                for cell in cells {
                    cell.encode(&mut out);
                }
            }
            Node::Internal { keys, children } => {
                let right = children
                    .last()
                    .ok_or(BtError::Corruption("internal node without children"))?;
                out.u8(KIND_INTERNAL).u8(0).u16(keys.len() as u16).u32(right.0);
                for (key, child) in keys.iter().zip(children) {
                    out.blob(key).u32(child.0);
                }
            }
        }
        out.pad_to(page_size);
        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_page_is_an_empty_leaf() -> Result<()> {
        assert_eq!(Node::decode(&[0u8; 512])?, Node::empty_leaf());
        Ok(())
    }

    #[test]
    fn internal_node_keeps_children_in_order() -> Result<()> {
        let node = Node::Internal {
            keys: vec![b"m".to_vec(), b"t".to_vec()],
            children: vec![PageNo(5), PageNo(6), PageNo(7)],
        };
        let page = node.encode(512)?;
        assert_eq!(page.len(), 512);
        assert_eq!(Node::decode(&page)?, node);
        Ok(())
    }

    #[test]
    fn oversized_node_is_refused() {
        let cells = (0..20u8)
            .map(|i| Cell::Inline {
                key: vec![i],
                value: vec![0; 40],
            })
            .collect();
        assert!(Node::Leaf(cells).encode(512).is_err());
    }
}
