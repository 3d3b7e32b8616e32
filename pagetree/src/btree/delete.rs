//! Deletion with sibling merging and redistribution.
//!
//! After a record is removed, each rebuilt child on the way back up is
//! checked against the merge threshold. An empty child, or one that fell
//! below the threshold, is merged into its left or right sibling when the
//! result fits in a page. When neither merge fits, one record is moved over
//! from a sibling instead. The parent loses a link for every merge and may
//! underflow in turn.
//!
//! Deletion can also grow an internal node: when a child's first key
//! changes, the parent's copy of it may get longer. Such a parent is split
//! one level up, exactly as on insert.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::node::{NODE_HEADER_SIZE, Node, NodeType};
use crate::btree::tree::{
    BTree, BTreeError, Link, check_key, insert_record, remove_record, replace_links, split,
};
use crate::page::{PAGE_SIZE, PagePtr};
use crate::store::PageStore;

/// Which sibling a child was rebalanced against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl<S: PageStore> BTree<S> {
    /// Remove a key.
    ///
    /// Returns whether the key was present. When it was not, no page is
    /// touched and the root is unchanged.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, BTreeError> {
        check_key(key)?;

        let Some(root_ptr) = self.root() else {
            return Ok(false);
        };

        let root = self.read_node(root_ptr)?;
        let mut superseded = vec![root_ptr];
        let Some(updated) = self.delete_from(&root, key, &mut superseded)? else {
            return Ok(false);
        };

        let new_root = self.settle_root(updated, &mut superseded)?;
        self.commit(new_root, superseded);
        Ok(true)
    }

    /// Delete from the subtree rooted at `node`, returning its replacement,
    /// or None if the key is absent.
    fn delete_from(
        &mut self,
        node: &Node,
        key: &[u8],
        superseded: &mut Vec<PagePtr>,
    ) -> Result<Option<Node>, BTreeError> {
        match node.node_type() {
            NodeType::Leaf => Ok(node.search(key).ok().map(|idx| remove_record(node, idx))),
            NodeType::Internal => {
                let idx = node.lookup_le(key);
                let child_ptr = node.child(idx);
                let child = self.read_node(child_ptr)?;
                let Some(updated) = self.delete_from(&child, key, superseded)? else {
                    return Ok(None);
                };
                superseded.push(child_ptr);
                self.rebalance_child(node, idx, updated, superseded).map(Some)
            }
        }
    }

    /// Rebuild `parent` around the replacement of its child at `idx`.
    fn rebalance_child(
        &mut self,
        parent: &Node,
        idx: usize,
        updated: Node,
        superseded: &mut Vec<PagePtr>,
    ) -> Result<Node, BTreeError> {
        if !updated.fits_page() {
            let parts = split(updated);
            let links = self.allocate_links(&parts)?;
            return Ok(replace_links(parent, idx, 1, &links));
        }
        if !updated.is_empty() && updated.encoded_size() >= self.merge_threshold() {
            let link = self.allocate_link(&updated)?;
            return Ok(replace_links(parent, idx, 1, &[link]));
        }

        let left = if idx > 0 {
            let ptr = parent.child(idx - 1);
            Some((ptr, self.read_node(ptr)?))
        } else {
            None
        };
        if let Some((ptr, sibling)) = &left
            && merged_size(sibling, &updated) <= PAGE_SIZE
        {
            superseded.push(*ptr);
            let merged = merge(sibling, &updated);
            tracing::trace!("merged child {idx} into its left sibling");
            let link = self.allocate_link(&merged)?;
            return Ok(replace_links(parent, idx - 1, 2, &[link]));
        }

        let right = if idx + 1 < parent.len() {
            let ptr = parent.child(idx + 1);
            Some((ptr, self.read_node(ptr)?))
        } else {
            None
        };
        if let Some((ptr, sibling)) = &right
            && merged_size(&updated, sibling) <= PAGE_SIZE
        {
            superseded.push(*ptr);
            let merged = merge(&updated, sibling);
            tracing::trace!("merged child {idx} with its right sibling");
            let link = self.allocate_link(&merged)?;
            return Ok(replace_links(parent, idx, 2, &[link]));
        }

        for (side, sibling) in [(Side::Left, left), (Side::Right, right)] {
            let Some((ptr, sibling)) = sibling else {
                continue;
            };
            let Some((first, second)) = redistribute(side, &sibling, &updated) else {
                continue;
            };
            superseded.push(ptr);
            tracing::trace!("moved one record from the {side:?} sibling into child {idx}");
            let first = self.allocate_link(&first)?;
            let second = self.allocate_link(&second)?;
            let start = if side == Side::Left { idx - 1 } else { idx };
            return Ok(replace_links(parent, start, 2, &[first, second]));
        }

        if updated.is_empty() {
            // Only child of its parent: the parent empties too and is merged
            // one level up, or becomes the empty tree at the root.
            assert_eq!(parent.len(), 1, "empty child left beside its siblings");
            return Ok(Node::empty(NodeType::Internal));
        }

        let link = self.allocate_link(&updated)?;
        Ok(replace_links(parent, idx, 1, &[link]))
    }

    /// Turn the rebuilt root into the new root pointer, collapsing internal
    /// roots with a single child and emptying the tree when nothing is left.
    fn settle_root(
        &mut self,
        mut node: Node,
        superseded: &mut Vec<PagePtr>,
    ) -> Result<Option<PagePtr>, BTreeError> {
        loop {
            if node.is_empty() {
                tracing::debug!("tree is now empty");
                return Ok(None);
            }
            if node.is_leaf() || node.len() > 1 {
                return self.allocate_root(node).map(Some);
            }

            let child = node.child(0);
            let child_node = self.read_node(child)?;
            tracing::debug!("collapsed single-child root into {child}");
            if child_node.is_leaf() || child_node.len() > 1 {
                return Ok(Some(child));
            }
            superseded.push(child);
            node = child_node;
        }
    }

    fn allocate_link(&mut self, node: &Node) -> Result<Link, BTreeError> {
        let ptr = self.allocate(node)?;
        Ok(Link {
            ptr,
            first_key: node.key(0).to_vec(),
        })
    }
}

/// Size of the node `merge(left, right)` would produce.
fn merged_size(left: &Node, right: &Node) -> usize {
    left.encoded_size() + right.encoded_size() - NODE_HEADER_SIZE
}

/// Concatenate two siblings of the same type.
fn merge(left: &Node, right: &Node) -> Node {
    assert_eq!(
        left.node_type(),
        right.node_type(),
        "siblings of different node types"
    );
    let mut new = Node::scratch();
    new.set_header(left.node_type(), (left.len() + right.len()) as u16);
    new.append_range(left, 0, 0, left.len());
    new.append_range(right, left.len(), 0, right.len());
    new
}

/// Move the record of `sibling` nearest to `updated` across.
///
/// Returns the new (left, right) pair in tree order, or None when the
/// sibling would be left empty or the receiving node would overflow.
fn redistribute(side: Side, sibling: &Node, updated: &Node) -> Option<(Node, Node)> {
    if sibling.len() < 2 {
        return None;
    }

    match side {
        Side::Left => {
            let last = sibling.len() - 1;
            let receiver = insert_record(
                updated,
                0,
                sibling.child(last),
                sibling.key(last),
                sibling.value(last),
            );
            receiver
                .fits_page()
                .then(|| (remove_record(sibling, last), receiver))
        }
        Side::Right => {
            let receiver = insert_record(
                updated,
                updated.len(),
                sibling.child(0),
                sibling.key(0),
                sibling.value(0),
            );
            receiver
                .fits_page()
                .then(|| (receiver, remove_record(sibling, 0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::MAX_KEY_SIZE;
    use crate::config::TreeConfig;
    use crate::simulation::{InvariantChecker, SimulatedPageStore};
    use crate::testing::{new_test_tree, numbered_key};

    fn leaf_of(entries: &[(&[u8], usize)]) -> Node {
        let mut node = Node::scratch();
        node.set_header(NodeType::Leaf, entries.len() as u16);
        for (i, (key, value_len)) in entries.iter().enumerate() {
            node.append_kv(i, PagePtr::NULL, key, &vec![0u8; *value_len]);
        }
        node
    }

    #[test]
    fn test_btree_remove() {
        let mut tree = new_test_tree();

        tree.insert(b"key", b"value").expect("insert");
        assert!(tree.get(b"key").expect("get").is_some());

        assert!(tree.delete(b"key").expect("delete"));
        assert!(tree.get(b"key").expect("get after delete").is_none());
        assert!(tree.is_empty());
        assert_eq!(tree.store().live_pages(), 0);
    }

    #[test]
    fn test_delete_missing_key_touches_nothing() {
        let mut tree = new_test_tree();
        assert!(!tree.delete(b"nothing").expect("delete from empty"));

        tree.insert(b"a", b"1").expect("insert");
        tree.insert(b"c", b"3").expect("insert");
        let root = tree.root();
        let allocations = tree.store().stats().allocations;

        assert!(!tree.delete(b"b").expect("delete missing"));
        assert_eq!(tree.root(), root);
        assert_eq!(tree.store().stats().allocations, allocations);
        assert_eq!(tree.store().stats().deallocations, 1);
    }

    #[test]
    fn test_delete_rejects_oversized_key() {
        let mut tree = new_test_tree();
        let err = tree.delete(&[0u8; 1001]).expect_err("key too large");
        assert!(matches!(err, BTreeError::InvalidEntry(_)));
    }

    #[test]
    fn test_delete_keeps_other_keys() {
        let mut tree = new_test_tree();
        for i in 0..400u32 {
            tree.insert(&numbered_key(i), &[i as u8; 50]).expect("insert");
        }

        for i in (0..400u32).filter(|i| i % 3 == 0) {
            assert!(tree.delete(&numbered_key(i)).expect("delete"));
        }

        for i in 0..400u32 {
            let value = tree.get(&numbered_key(i)).expect("get");
            if i % 3 == 0 {
                assert_eq!(value, None, "key {i} should be gone");
            } else {
                assert_eq!(value, Some(vec![i as u8; 50]), "key {i} should remain");
            }
        }
        InvariantChecker::new(tree.store())
            .check(tree.root())
            .expect("tree should be valid");
    }

    #[test]
    fn test_delete_first_key_updates_parent() {
        let mut tree = new_test_tree();
        for i in 0..300u32 {
            tree.insert(&numbered_key(i), &[0u8; 64]).expect("insert");
        }
        assert!(tree.height().expect("height") >= 2);

        assert!(tree.delete(&numbered_key(0)).expect("delete"));
        let root = tree.read_node(tree.root().expect("root")).expect("read root");
        assert_eq!(root.key(0), numbered_key(1).as_slice());
        InvariantChecker::new(tree.store())
            .check(tree.root())
            .expect("tree should be valid");
    }

    #[test]
    fn test_insert_then_delete_all_empties_tree() {
        let mut tree = new_test_tree();
        let n = 600u32;
        for i in 0..n {
            tree.insert(&numbered_key(i), &[7u8; 120]).expect("insert");
        }
        assert!(tree.height().expect("height") >= 2);

        // Interleave deletes from both ends and the middle.
        let mut order: Vec<u32> = (0..n).collect();
        order.sort_by_key(|i| (i % 7, *i));
        for (deleted, i) in order.iter().enumerate() {
            assert!(tree.delete(&numbered_key(*i)).expect("delete"));
            if deleted % 50 == 0 {
                InvariantChecker::new(tree.store())
                    .check(tree.root())
                    .expect("tree should stay valid");
            }
        }

        assert!(tree.is_empty());
        assert_eq!(tree.height().expect("height"), 0);
        assert_eq!(tree.store().live_pages(), 0);
    }

    #[test]
    fn test_large_values_shrink_back() {
        let mut tree = new_test_tree();
        for i in 0..500u32 {
            tree.insert(&numbered_key(i), &[9u8; 900]).expect("insert");
        }
        let tall = tree.height().expect("height");
        assert!(tall >= 2);

        for i in 0..499u32 {
            assert!(tree.delete(&numbered_key(i)).expect("delete"));
        }

        assert_eq!(tree.height().expect("height"), 1);
        assert_eq!(
            tree.get(&numbered_key(499)).expect("get"),
            Some(vec![9u8; 900])
        );
        assert_eq!(tree.store().live_pages(), 1);
    }

    #[test]
    fn test_zero_threshold_still_merges_empty_nodes() {
        let config = TreeConfig::default().with_merge_threshold(0);
        let mut tree = BTree::with_config(SimulatedPageStore::new(3), None, config);
        for i in 0..200u32 {
            tree.insert(&numbered_key(i), &[1u8; 300]).expect("insert");
        }
        for i in 0..150u32 {
            assert!(tree.delete(&numbered_key(i)).expect("delete"));
        }

        InvariantChecker::new(tree.store())
            .check(tree.root())
            .expect("tree should be valid");
        for i in 150..200u32 {
            assert!(tree.get(&numbered_key(i)).expect("get").is_some());
        }
    }

    #[test]
    fn test_merge_concatenates_siblings() {
        let left = leaf_of(&[(b"a", 10), (b"b", 10)]);
        let right = leaf_of(&[(b"c", 10)]);

        assert_eq!(
            merged_size(&left, &right),
            left.encoded_size() + right.encoded_size() - NODE_HEADER_SIZE
        );
        let merged = merge(&left, &right);
        assert_eq!(merged.key_count(), 3);
        assert_eq!(merged.key(2), b"c");
        assert_eq!(merged.encoded_size(), merged_size(&left, &right));
    }

    #[test]
    fn test_redistribute_from_left() {
        let sibling = leaf_of(&[(b"a", 1500), (b"b", 1500), (b"c", 900)]);
        let updated = leaf_of(&[(b"d", 200)]);
        assert!(merged_size(&sibling, &updated) > PAGE_SIZE);

        let (left, right) =
            redistribute(Side::Left, &sibling, &updated).expect("should redistribute");
        assert_eq!(left.key_count(), 2);
        assert_eq!(left.key(1), b"b");
        assert_eq!(right.key_count(), 2);
        assert_eq!(right.key(0), b"c");
        assert_eq!(right.key(1), b"d");
    }

    #[test]
    fn test_redistribute_from_right() {
        let sibling = leaf_of(&[(b"m", 900), (b"n", 1500), (b"o", 1500)]);
        let updated = leaf_of(&[(b"a", 200)]);

        let (left, right) =
            redistribute(Side::Right, &sibling, &updated).expect("should redistribute");
        assert_eq!(left.key_count(), 2);
        assert_eq!(left.key(1), b"m");
        assert_eq!(right.key(0), b"n");
    }

    #[test]
    fn test_redistribute_refuses_to_empty_sibling() {
        let sibling = leaf_of(&[(b"a", 3000)]);
        let updated = leaf_of(&[(b"b", 1000)]);
        assert!(redistribute(Side::Left, &sibling, &updated).is_none());
    }

    #[test]
    fn test_redistribute_refuses_overflow() {
        let sibling = leaf_of(&[(b"a", 100), (b"b", 3000)]);
        let updated = leaf_of(&[(b"c", 1000)]);
        assert!(redistribute(Side::Left, &sibling, &updated).is_none());
    }

    #[test]
    fn test_underfull_leaf_borrows_when_merge_overflows() {
        let mut tree = new_test_tree();
        // Leaves end up as {a, b} and {c, d, e}.
        tree.insert(b"a", &[1u8; 1540]).expect("insert");
        tree.insert(b"b", &[2u8; 1540]).expect("insert");
        tree.insert(b"c", &[3u8; 950]).expect("insert");
        tree.insert(b"d", &[4u8; 1200]).expect("insert");
        tree.insert(b"e", &[5u8; 10]).expect("insert");
        assert_eq!(tree.height().expect("height"), 2);

        // {c, e} is under the threshold but too big to merge into {a, b}.
        assert!(tree.delete(b"d").expect("delete"));

        let root = tree.read_node(tree.root().expect("root")).expect("read root");
        assert_eq!(root.key_count(), 2);
        assert_eq!(root.key(1), b"b");
        InvariantChecker::new(tree.store())
            .check(tree.root())
            .expect("tree should be valid");
        for (key, byte, len) in [
            (b"a", 1u8, 1540),
            (b"b", 2, 1540),
            (b"c", 3, 950),
            (b"e", 5, 10),
        ] {
            assert_eq!(tree.get(key).expect("get"), Some(vec![byte; len]));
        }
    }

    #[test]
    fn test_longer_first_key_splits_parent() {
        let mut tree = new_test_tree();
        // Many leaves with short first keys, each followed by a long key.
        for i in 0..40u8 {
            tree.insert(&[b'a' + i / 4, i], &[0u8; 3000]).expect("insert short");
        }
        let long_keys: Vec<Vec<u8>> = (0..40u8)
            .map(|i| {
                let mut key = vec![b'a' + i / 4, i, 0];
                key.resize(MAX_KEY_SIZE, i);
                key
            })
            .collect();
        for key in &long_keys {
            tree.insert(key, b"x").expect("insert long");
        }

        for i in 0..40u8 {
            assert!(tree.delete(&[b'a' + i / 4, i]).expect("delete short"));
            InvariantChecker::new(tree.store())
                .check(tree.root())
                .expect("tree should stay valid");
        }
        for key in &long_keys {
            assert_eq!(tree.get(key).expect("get"), Some(b"x".to_vec()));
        }
    }
}
