//! # Leaf Chain
//!
//! Leaves form a circular doubly-linked list through the `prev`/`next`
//! addresses in their headers, and the engine additionally tracks the head
//! (smallest keys) and tail (largest keys) so range scans can start at
//! either end. Splits splice the new sibling in right after the leaf that
//! split; merges unlink the leaf being freed and heal the endpoints.

use eyre::Result;

use crate::storage::FileSpace;

use super::leaf::{LeafMut, LeafRef};

#[derive(Debug, Clone, Copy)]
pub struct LeafChain {
    head_addr: i64,
    tail_addr: i64,
}

impl LeafChain {
    /// Starts a chain at a single leaf, linking it to itself.
    pub fn new(space: &mut FileSpace, leaf_addr: i64) -> Result<Self> {
        let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
        leaf.set_prev_addr(leaf_addr);
        leaf.set_next_addr(leaf_addr);

        Ok(Self {
            head_addr: leaf_addr,
            tail_addr: leaf_addr,
        })
    }

    /// Restores a chain from its persisted endpoints.
    pub fn with_endpoints(head_addr: i64, tail_addr: i64) -> Self {
        Self {
            head_addr,
            tail_addr,
        }
    }

    pub fn head_addr(&self) -> i64 {
        self.head_addr
    }

    pub fn tail_addr(&self) -> i64 {
        self.tail_addr
    }

    /// Splices `leaf_addr` in immediately after `prev_addr`.
    pub fn insert_after(&mut self, space: &mut FileSpace, leaf_addr: i64, prev_addr: i64) -> Result<()> {
        let next_addr = LeafRef::from_page(space.access_aligned(prev_addr)?)?.next_addr();

        {
            let mut leaf = LeafMut::from_page(space.access_aligned_mut(leaf_addr)?)?;
            leaf.set_prev_addr(prev_addr);
            leaf.set_next_addr(next_addr);
        }
        LeafMut::from_page(space.access_aligned_mut(prev_addr)?)?.set_next_addr(leaf_addr);
        LeafMut::from_page(space.access_aligned_mut(next_addr)?)?.set_prev_addr(leaf_addr);

        if prev_addr == self.tail_addr {
            self.tail_addr = leaf_addr;
        }
        Ok(())
    }

    /// Unlinks `leaf_addr`, healing its neighbours and the endpoints.
    pub fn remove(&mut self, space: &mut FileSpace, leaf_addr: i64) -> Result<()> {
        let (prev_addr, next_addr) = {
            let leaf = LeafRef::from_page(space.access_aligned(leaf_addr)?)?;
            (leaf.prev_addr(), leaf.next_addr())
        };

        LeafMut::from_page(space.access_aligned_mut(prev_addr)?)?.set_next_addr(next_addr);
        LeafMut::from_page(space.access_aligned_mut(next_addr)?)?.set_prev_addr(prev_addr);

        if leaf_addr == self.head_addr {
            self.head_addr = next_addr;
        } else if leaf_addr == self.tail_addr {
            self.tail_addr = prev_addr;
        }
        Ok(())
    }
}
