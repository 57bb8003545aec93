//! # Range Iterators
//!
//! A `RangeIter` walks the leaf chain between two resolved endpoints,
//! forward via `next` addresses or backward via `prev` addresses. It
//! borrows the backend read-only for its whole lifetime, so the borrow
//! checker rules out mutating the tree mid-iteration.
//!
//! Reading from an exhausted iterator is an error; `is_at_end` is the
//! supported predicate.

use eyre::{bail, Result};

use crate::storage::FileSpace;

use super::key::read_key;
use super::leaf::LeafRef;
use super::value::read_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy)]
struct IterPosition {
    leaf_addr: i64,
    record_index: usize,
    last_leaf_addr: i64,
    last_record_index: usize,
}

/// An iteration over the records in a key range.
#[derive(Debug)]
pub struct RangeIter<'a> {
    space: &'a FileSpace,
    direction: Direction,
    position: Option<IterPosition>,
}

impl<'a> RangeIter<'a> {
    /// Ascending iteration from the `(leaf, index)` of the range's smallest
    /// record to that of its largest; `None` for an empty range.
    pub(super) fn forward(
        space: &'a FileSpace,
        endpoints: Option<(i64, usize, i64, usize)>,
    ) -> Self {
        Self {
            space,
            direction: Direction::Forward,
            position: endpoints.map(|(min_leaf, min_index, max_leaf, max_index)| IterPosition {
                leaf_addr: min_leaf,
                record_index: min_index,
                last_leaf_addr: max_leaf,
                last_record_index: max_index,
            }),
        }
    }

    /// Descending iteration over the same endpoints.
    pub(super) fn backward(
        space: &'a FileSpace,
        endpoints: Option<(i64, usize, i64, usize)>,
    ) -> Self {
        Self {
            space,
            direction: Direction::Backward,
            position: endpoints.map(|(min_leaf, min_index, max_leaf, max_index)| IterPosition {
                leaf_addr: max_leaf,
                record_index: max_index,
                last_leaf_addr: min_leaf,
                last_record_index: min_index,
            }),
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.position.is_none()
    }

    /// Reads the current record's raw key.
    pub fn read_key(&self) -> Result<Vec<u8>> {
        let position = self.check_end()?;
        let leaf = LeafRef::from_page(self.space.access_aligned(position.leaf_addr)?)?;
        read_key(self.space, leaf.key_at(position.record_index)?)
    }

    /// Reads the current record's raw value.
    pub fn read_value(&self) -> Result<Vec<u8>> {
        let position = self.check_end()?;
        let leaf = LeafRef::from_page(self.space.access_aligned(position.leaf_addr)?)?;
        read_value(self.space, leaf.value_at(position.record_index)?)
    }

    /// Reads the current record's raw key and value.
    pub fn read_record(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let position = self.check_end()?;
        let leaf = LeafRef::from_page(self.space.access_aligned(position.leaf_addr)?)?;
        let key = read_key(self.space, leaf.key_at(position.record_index)?)?;
        let value = read_value(self.space, leaf.value_at(position.record_index)?)?;
        Ok((key, value))
    }

    /// Moves to the next record in iteration order; past the final record
    /// the iterator becomes exhausted. Advancing an exhausted iterator is a
    /// no-op.
    pub fn advance(&mut self) -> Result<()> {
        let Some(mut position) = self.position else {
            return Ok(());
        };

        if position.leaf_addr == position.last_leaf_addr
            && position.record_index == position.last_record_index
        {
            self.position = None;
            return Ok(());
        }

        match self.direction {
            Direction::Forward => {
                let leaf = LeafRef::from_page(self.space.access_aligned(position.leaf_addr)?)?;
                if position.record_index < leaf.record_count() - 1 {
                    position.record_index += 1;
                } else {
                    position.leaf_addr = leaf.next_addr();
                    position.record_index = 0;
                }
            }
            Direction::Backward => {
                if position.record_index >= 1 {
                    position.record_index -= 1;
                } else {
                    let leaf = LeafRef::from_page(self.space.access_aligned(position.leaf_addr)?)?;
                    let prev_addr = leaf.prev_addr();
                    let prev = LeafRef::from_page(self.space.access_aligned(prev_addr)?)?;
                    position.leaf_addr = prev_addr;
                    position.record_index = prev.record_count() - 1;
                }
            }
        }

        self.position = Some(position);
        Ok(())
    }

    fn check_end(&self) -> Result<&IterPosition> {
        match &self.position {
            Some(position) => Ok(position),
            None => bail!("end of iteration"),
        }
    }
}
