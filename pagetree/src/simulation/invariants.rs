//! Invariant checking for deterministic simulation testing.
//!
//! Walks every page reachable from a root and verifies the structural
//! properties the tree engine promises after each operation:
//! - keys are strictly increasing within every node
//! - every internal key equals the first key of the child it points to
//! - every key lies within the range its parent assigns to the subtree
//! - all leaves sit at the same depth
//! - no node below the root is empty, and an internal root has at least
//!   two children

use crate::btree::{BTreeError, Node, NodeType};
use crate::page::PagePtr;
use crate::store::PageStore;

/// Summary of a valid tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels; 0 for the empty tree.
    pub height: usize,
    /// Number of leaf pages.
    pub leaves: usize,
    /// Number of internal pages.
    pub internals: usize,
    /// Number of key-value entries.
    pub entries: usize,
}

/// A broken tree invariant.
#[derive(Debug)]
pub enum InvariantViolation {
    /// A page could not be read or decoded.
    Unreadable { ptr: PagePtr, error: BTreeError },
    /// Keys within a node are not strictly increasing.
    Unsorted { ptr: PagePtr, index: usize },
    /// An internal key does not match its child's first key.
    ParentKeyMismatch { parent: PagePtr, index: usize },
    /// A key falls outside the range assigned by the parent.
    OutOfRange { ptr: PagePtr, index: usize },
    /// Leaves found at different depths.
    UnevenDepth { ptr: PagePtr, depth: usize, expected: usize },
    /// An empty node below the root.
    EmptyNode(PagePtr),
    /// The root is an empty node or an internal node with a single child.
    DegenerateRoot(PagePtr),
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreadable { ptr, error } => write!(f, "page {ptr} unreadable: {error}"),
            Self::Unsorted { ptr, index } => {
                write!(f, "page {ptr}: key {index} is not greater than its predecessor")
            }
            Self::ParentKeyMismatch { parent, index } => write!(
                f,
                "page {parent}: key {index} differs from the first key of its child"
            ),
            Self::OutOfRange { ptr, index } => {
                write!(f, "page {ptr}: key {index} is outside its subtree range")
            }
            Self::UnevenDepth {
                ptr,
                depth,
                expected,
            } => write!(f, "leaf {ptr} at depth {depth}, expected {expected}"),
            Self::EmptyNode(ptr) => write!(f, "page {ptr} is an empty non-root node"),
            Self::DegenerateRoot(ptr) => write!(f, "root {ptr} is degenerate"),
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Checks tree invariants against a page store.
pub struct InvariantChecker<'a, S: PageStore + ?Sized> {
    store: &'a S,
}

/// Bounds a subtree's keys must respect: `lower <= key < upper`.
struct Range<'k> {
    lower: Option<&'k [u8]>,
    upper: Option<&'k [u8]>,
}

/// Per-walk state.
#[derive(Default)]
struct Walk {
    shape: TreeShape,
    leaf_depth: Option<usize>,
}

impl<'a, S: PageStore + ?Sized> InvariantChecker<'a, S> {
    /// Create a checker reading through `store`.
    #[must_use]
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Check the tree rooted at `root`.
    pub fn check(&self, root: Option<PagePtr>) -> Result<TreeShape, InvariantViolation> {
        let Some(root) = root else {
            return Ok(TreeShape::default());
        };

        let node = self.read(root)?;
        if node.is_empty() || (node.node_type() == NodeType::Internal && node.len() < 2) {
            return Err(InvariantViolation::DegenerateRoot(root));
        }

        let mut walk = Walk::default();
        let range = Range {
            lower: None,
            upper: None,
        };
        self.check_node(root, &node, 1, &range, &mut walk)?;
        walk.shape.height = walk.leaf_depth.unwrap_or(0);
        Ok(walk.shape)
    }

    fn read(&self, ptr: PagePtr) -> Result<Node, InvariantViolation> {
        let page = self
            .store
            .get(ptr)
            .map_err(|e| InvariantViolation::Unreadable {
                ptr,
                error: BTreeError::Store(e),
            })?;
        Node::from_page(page).map_err(|e| InvariantViolation::Unreadable {
            ptr,
            error: BTreeError::Node(e),
        })
    }

    fn check_node(
        &self,
        ptr: PagePtr,
        node: &Node,
        depth: usize,
        range: &Range<'_>,
        walk: &mut Walk,
    ) -> Result<(), InvariantViolation> {
        if node.is_empty() {
            return Err(InvariantViolation::EmptyNode(ptr));
        }

        for index in 0..node.len() {
            let key = node.key(index);
            if index > 0 && node.key(index - 1) >= key {
                return Err(InvariantViolation::Unsorted { ptr, index });
            }
            let below = range.lower.is_some_and(|lower| key < lower);
            let above = range.upper.is_some_and(|upper| key >= upper);
            if below || above {
                return Err(InvariantViolation::OutOfRange { ptr, index });
            }
        }

        match node.node_type() {
            NodeType::Leaf => {
                walk.shape.leaves += 1;
                walk.shape.entries += node.len();
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(InvariantViolation::UnevenDepth {
                            ptr,
                            depth,
                            expected,
                        });
                    }
                    Some(_) => {}
                }
            }
            NodeType::Internal => {
                walk.shape.internals += 1;
                for index in 0..node.len() {
                    let child_ptr = node.child(index);
                    let child = self.read(child_ptr)?;
                    if child.is_empty() {
                        return Err(InvariantViolation::EmptyNode(child_ptr));
                    }
                    if child.key(0) != node.key(index) {
                        return Err(InvariantViolation::ParentKeyMismatch { parent: ptr, index });
                    }
                    let child_range = Range {
                        lower: Some(node.key(index)),
                        upper: if index + 1 < node.len() {
                            Some(node.key(index + 1))
                        } else {
                            range.upper
                        },
                    };
                    self.check_node(child_ptr, &child, depth + 1, &child_range, walk)?;
                }
            }
        }

        Ok(())
    }
}
