//! Ordered iteration.
//!
//! Leaves carry no sibling links (a copy-on-write rewrite would have to
//! touch every neighbour), so the iterator keeps the descent path instead.

use crate::btree::node::Node;
use crate::btree::tree::{BTree, BTreeError, load_node};
use crate::page::PagePtr;
use crate::store::PageStore;

impl<S: PageStore> BTree<S> {
    /// Iterate over all entries in key order.
    pub fn iter(&self) -> Result<BTreeIterator<'_, S>, BTreeError> {
        let mut stack = Vec::new();
        if let Some(root) = self.root() {
            stack.push((self.read_node(root)?, 0));
        }
        Ok(BTreeIterator {
            store: self.store(),
            stack,
        })
    }

    /// Iterate in key order starting at the first key `>=` `start_key`.
    pub fn iter_from(&self, start_key: &[u8]) -> Result<BTreeIterator<'_, S>, BTreeError> {
        let mut stack = Vec::new();
        let mut next = self.root();
        while let Some(ptr) = next {
            let node = self.read_node(ptr)?;
            if node.is_leaf() {
                let idx = node.search(start_key).unwrap_or_else(|i| i);
                stack.push((node, idx));
                next = None;
            } else {
                let idx = node.lookup_le(start_key);
                next = Some(node.child(idx));
                stack.push((node, idx));
            }
        }
        Ok(BTreeIterator {
            store: self.store(),
            stack,
        })
    }

    /// Count the total number of entries in the tree.
    pub fn count(&self) -> Result<usize, BTreeError> {
        let mut count = 0;
        let mut pending: Vec<PagePtr> = self.root().into_iter().collect();
        while let Some(ptr) = pending.pop() {
            let node = self.read_node(ptr)?;
            if node.is_leaf() {
                count += node.len();
            } else {
                pending.extend((0..node.len()).map(|i| node.child(i)));
            }
        }
        Ok(count)
    }
}

/// Iterator over B-tree entries.
///
/// Each stack frame is a node and the index of the child being visited
/// (internal) or the next record to return (leaf).
pub struct BTreeIterator<'a, S: PageStore> {
    store: &'a S,
    stack: Vec<(Node, usize)>,
}

impl<S: PageStore> BTreeIterator<'_, S> {
    /// Get the next entry.
    ///
    /// After an error the iterator is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        loop {
            let Some((node, idx)) = self.stack.last_mut() else {
                return Ok(None);
            };

            if *idx >= node.len() {
                self.stack.pop();
                if let Some((_, parent_idx)) = self.stack.last_mut() {
                    *parent_idx += 1;
                }
                continue;
            }

            if node.is_leaf() {
                let entry = (node.key(*idx).to_vec(), node.value(*idx).to_vec());
                *idx += 1;
                return Ok(Some(entry));
            }

            let child = node.child(*idx);
            match load_node(self.store, child) {
                Ok(child) => self.stack.push((child, 0)),
                Err(e) => {
                    self.stack.clear();
                    return Err(e);
                }
            }
        }
    }
}

impl<S: PageStore> Iterator for BTreeIterator<'_, S> {
    type Item = Result<(Vec<u8>, Vec<u8>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
