//! Copy-on-write B+tree over an external page store.
//!
//! # Structure
//!
//! The tree consists of:
//! - Internal nodes: one child pointer per key, where each key is the first
//!   key of the child subtree
//! - Leaf nodes: key-value records in sorted order
//!
//! Both share the layout documented on [`Node`]. Nodes are variable-sized
//! and split by bytes, not by key count: a node is split when its encoded
//! form exceeds a page and merged when it falls below the merge threshold.
//!
//! # Usage
//!
//! ```
//! use pagetree::BTree;
//! use pagetree::simulation::SimulatedPageStore;
//!
//! # fn main() -> Result<(), pagetree::BTreeError> {
//! let mut tree = BTree::new(SimulatedPageStore::new(42));
//! tree.insert(b"hello", b"world")?;
//! assert_eq!(tree.get(b"hello")?, Some(b"world".to_vec()));
//!
//! // Publish the new root to readers.
//! let root = tree.root();
//! assert!(root.is_some());
//! # Ok(())
//! # }
//! ```

mod delete;
mod iter;
mod node;
mod tree;

pub use iter::BTreeIterator;
pub use node::{
    MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_HEADER_SIZE, Node, NodeError, NodeType, SLOT_SIZE,
};
pub use tree::{BTree, BTreeError, EntryError};
