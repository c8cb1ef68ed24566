//! Cursors over the combined view of fast-insert levels and the main tree.
//!
//! A cursor remembers the key it is on. Its decoded path is reused only
//! while the connection has not changed anything and the same transaction
//! is open; otherwise the next call rebuilds it from the remembered key, so
//! a cursor survives writes, commits and other connections' changes.

use crate::storage::btree::overflow::{full_value, read_value};
use crate::storage::btree::Cell;
use crate::storage::fastinsert::MultiCursor;
use crate::types::{BtError, Result};

use super::{Db, SeekMode, SeekResult, Target};

struct View {
    generation: u64,
    inner: MultiCursor,
}

/// Position in a database. Every call takes the connection it was made for.
#[derive(Default)]
pub struct Cursor {
    view: Option<View>,
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("key", &self.key).finish()
    }
}

enum Step {
    Next,
    Prev,
}

impl Cursor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Key under the cursor.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// True when the cursor is on an entry.
    pub fn valid(&self) -> bool {
        self.key.is_some()
    }

    /// Releases the cursor.
    pub fn close(self) {}

    fn settle(&mut self, db: &Db, inner: MultiCursor) -> bool {
        self.key = inner.key().map(<[u8]>::to_vec);
        self.view = Some(View {
            generation: db.generation(),
            inner,
        });
        self.key.is_some()
    }

    /// The decoded view, if it is still current.
    fn reuse(&mut self, db: &Db) -> Option<MultiCursor> {
        match self.view.take() {
            Some(view) if view.generation == db.generation() => Some(view.inner),
            _ => None,
        }
    }

    /// Positions on the first entry.
    pub fn first(&mut self, db: &mut Db) -> Result<bool> {
        db.read(|db| {
            let mut inner = db.view()?;
            inner.first(db.pager_mut()?)?;
            Ok(self.settle(db, inner))
        })
    }

    /// Positions on the last entry.
    pub fn last(&mut self, db: &mut Db) -> Result<bool> {
        db.read(|db| {
            let mut inner = db.view()?;
            inner.last(db.pager_mut()?)?;
            Ok(self.settle(db, inner))
        })
    }

    /// Positions relative to `key`.
    pub fn seek(&mut self, db: &mut Db, key: &[u8], mode: SeekMode) -> Result<SeekResult> {
        db.read(|db| {
            let mut inner = db.view()?;
            let result = inner.seek(db.pager_mut()?, key, mode)?;
            self.settle(db, inner);
            Ok(result)
        })
    }

    /// Moves to the next entry. Returns `false` past the end.
    pub fn next(&mut self, db: &mut Db) -> Result<bool> {
        self.step(db, Step::Next)
    }

    /// Moves to the previous entry. Returns `false` before the start.
    pub fn prev(&mut self, db: &mut Db) -> Result<bool> {
        self.step(db, Step::Prev)
    }

    fn step(&mut self, db: &mut Db, step: Step) -> Result<bool> {
        let Some(key) = self.key.clone() else {
            return Ok(false);
        };
        db.read(|db| {
            if let Some(mut inner) = self.reuse(db) {
                let pager = db.pager_mut()?;
                match step {
                    Step::Next => inner.next(pager)?,
                    Step::Prev => inner.prev(pager)?,
                };
                return Ok(self.settle(db, inner));
            }
            let mut inner = db.view()?;
            let pager = db.pager_mut()?;
            let (mode, exact_moves) = match step {
                Step::Next => (SeekMode::Ge, true),
                Step::Prev => (SeekMode::Le, false),
            };
            // a vanished key leaves the cursor between its neighbours
            if inner.seek(pager, &key, mode)? == SeekResult::Exact {
                if exact_moves {
                    inner.next(pager)?;
                } else {
                    inner.prev(pager)?;
                }
            }
            Ok(self.settle(db, inner))
        })
    }

    fn current(&mut self, db: &mut Db) -> Result<Cell> {
        let key = self.key.clone().ok_or(BtError::Misuse("cursor is not positioned"))?;
        if let Some(inner) = self.reuse(db) {
            let cell = inner.cell().cloned();
            self.view = Some(View {
                generation: db.generation(),
                inner,
            });
            if let Some(cell) = cell {
                return Ok(cell);
            }
        }
        let mut inner = db.view()?;
        if inner.seek(db.pager_mut()?, &key, SeekMode::Eq)? != SeekResult::Exact {
            return Err(BtError::NotFound);
        }
        let cell = inner.cell().cloned().ok_or(BtError::NotFound)?;
        self.settle(db, inner);
        Ok(cell)
    }

    /// `len` bytes of the value starting at `offset`; shorter at the end.
    pub fn data(&mut self, db: &mut Db, offset: u64, len: usize) -> Result<Vec<u8>> {
        db.read(|db| {
            let cell = self.current(db)?;
            read_value(db.pager_mut()?, &cell, offset, len)
        })
    }

    /// The whole value under the cursor.
    pub fn value(&mut self, db: &mut Db) -> Result<Vec<u8>> {
        db.read(|db| {
            let cell = self.current(db)?;
            full_value(db.pager_mut()?, &cell)
        })
    }

    /// Deletes the entry under the cursor. The cursor stays between its
    /// neighbours: `next` and `prev` move to them.
    pub fn delete(&mut self, db: &mut Db) -> Result<()> {
        let key = self.key.clone().ok_or(BtError::Misuse("cursor is not positioned"))?;
        self.view = None;
        db.replace(&key, None, Target::Main)
    }
}
