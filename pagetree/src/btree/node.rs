//! B-tree node layout and codec.
//!
//! Every node, internal or leaf, uses the same little-endian layout:
//!
//! ```text
//! | type | nkeys | pointers   | offsets    | key-values
//! | 2B   | 2B    | nkeys * 8B | nkeys * 2B | ...
//!
//! key-value record:
//! | klen | vlen | key | val |
//! | 2B   | 2B   | ... | ... |
//! ```
//!
//! Offset slot `i` (1-based) holds where record `i` starts relative to the
//! key-value region, which is also where record `i - 1` ends. The start of
//! record 0 is implicitly 0, so the total size of a node is simply the
//! position of record `nkeys`.
//!
//! Internal records carry an empty value; leaf pointer slots are zeroed.
//! Index accessors panic on out-of-range indexes: those are bugs in the tree
//! engine, never input errors.

#![allow(clippy::cast_possible_truncation)]

use crate::page::{PAGE_SIZE, Page, PagePtr};

/// Size of the node header (`type` + `nkeys`).
pub const NODE_HEADER_SIZE: usize = 4;

/// Maximum key size accepted by the tree.
pub const MAX_KEY_SIZE: usize = 1000;

/// Maximum value size accepted by the tree.
pub const MAX_VALUE_SIZE: usize = 3000;

/// Size of one child pointer slot.
const POINTER_SIZE: usize = 8;

/// Size of one offset slot.
const OFFSET_SIZE: usize = 2;

/// `klen` + `vlen` prefix of every record.
const RECORD_HEADER_SIZE: usize = 4;

/// Per-key overhead outside the record itself (pointer + offset).
pub const SLOT_SIZE: usize = POINTER_SIZE + OFFSET_SIZE;

/// Size of a scratch buffer. A page-sized node plus one maximal record
/// always fits, so a single insert never overruns it.
pub const SCRATCH_SIZE: usize = 2 * PAGE_SIZE;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeType {
    Internal = 1,
    Leaf = 2,
}

impl TryFrom<u16> for NodeType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// A B-tree node backed by an owned byte buffer.
///
/// Nodes read from a store are exactly one page long. Nodes under
/// construction use a larger scratch buffer and may temporarily exceed the
/// page size until they are split.
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    data: Vec<u8>,
}

impl Node {
    /// Create a zeroed buffer of `len` bytes. The header must be set before
    /// anything else is written.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        assert!(len >= NODE_HEADER_SIZE, "node buffer smaller than header");
        Self {
            data: vec![0u8; len],
        }
    }

    /// Create a zeroed scratch buffer for building a node.
    #[must_use]
    pub fn scratch() -> Self {
        Self::with_len(SCRATCH_SIZE)
    }

    /// Create an empty node of the given type.
    #[must_use]
    pub fn empty(node_type: NodeType) -> Self {
        let mut node = Self::with_len(NODE_HEADER_SIZE);
        node.set_header(node_type, 0);
        node
    }

    /// Decode a node from a page, validating its structure.
    pub fn from_page(page: Page) -> Result<Self, NodeError> {
        let node = Self {
            data: page.into_vec(),
        };
        node.validate()?;
        Ok(node)
    }

    /// Encode the node into a page.
    ///
    /// Panics if the node does not fit in a page; callers split first.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let size = self.encoded_size();
        assert!(
            size <= PAGE_SIZE,
            "node of {size} bytes does not fit in a page"
        );
        Page::from_prefix(&self.data[..size])
    }

    /// Node type.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        let tag = read_u16(&self.data, 0);
        match NodeType::try_from(tag) {
            Ok(node_type) => node_type,
            Err(tag) => panic!("node header carries unknown type tag {tag}"),
        }
    }

    /// Whether this is a leaf node.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    /// Number of keys in the node.
    #[must_use]
    pub fn key_count(&self) -> u16 {
        read_u16(&self.data, 2)
    }

    /// Number of keys, as an index bound.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.key_count())
    }

    /// Whether the node holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_count() == 0
    }

    /// Set the node type and key count.
    pub fn set_header(&mut self, node_type: NodeType, key_count: u16) {
        write_u16(&mut self.data, 0, node_type as u16);
        write_u16(&mut self.data, 2, key_count);
    }

    /// Child pointer at `idx`.
    #[must_use]
    pub fn child(&self, idx: usize) -> PagePtr {
        assert!(idx < self.len(), "child index {idx} out of range");
        PagePtr(read_u64(&self.data, NODE_HEADER_SIZE + POINTER_SIZE * idx))
    }

    /// Set the child pointer at `idx`.
    pub fn set_child(&mut self, idx: usize, ptr: PagePtr) {
        assert!(idx < self.len(), "child index {idx} out of range");
        write_u64(
            &mut self.data,
            NODE_HEADER_SIZE + POINTER_SIZE * idx,
            ptr.get(),
        );
    }

    /// Byte position of offset slot `idx` (1-based).
    fn offset_pos(&self, idx: usize) -> usize {
        assert!(
            1 <= idx && idx <= self.len(),
            "offset slot {idx} out of range"
        );
        NODE_HEADER_SIZE + POINTER_SIZE * self.len() + OFFSET_SIZE * (idx - 1)
    }

    /// Start of record `idx` relative to the key-value region.
    #[must_use]
    pub fn offset(&self, idx: usize) -> u16 {
        if idx == 0 {
            return 0;
        }
        read_u16(&self.data, self.offset_pos(idx))
    }

    /// Set the start of record `idx` (1-based, up to `key_count`).
    pub fn set_offset(&mut self, idx: usize, offset: u16) {
        let pos = self.offset_pos(idx);
        write_u16(&mut self.data, pos, offset);
    }

    /// Absolute byte position of record `idx`; `key_count` yields the end
    /// of the last record.
    #[must_use]
    pub fn record_position(&self, idx: usize) -> usize {
        assert!(idx <= self.len(), "record index {idx} out of range");
        NODE_HEADER_SIZE + SLOT_SIZE * self.len() + usize::from(self.offset(idx))
    }

    /// Key of record `idx`.
    #[must_use]
    pub fn key(&self, idx: usize) -> &[u8] {
        assert!(idx < self.len(), "key index {idx} out of range");
        let pos = self.record_position(idx);
        let key_len = usize::from(read_u16(&self.data, pos));
        let start = pos + RECORD_HEADER_SIZE;
        &self.data[start..start + key_len]
    }

    /// Value of record `idx`.
    #[must_use]
    pub fn value(&self, idx: usize) -> &[u8] {
        assert!(idx < self.len(), "value index {idx} out of range");
        let pos = self.record_position(idx);
        let key_len = usize::from(read_u16(&self.data, pos));
        let value_len = usize::from(read_u16(&self.data, pos + 2));
        let start = pos + RECORD_HEADER_SIZE + key_len;
        &self.data[start..start + value_len]
    }

    /// Total bytes the node currently occupies.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.record_position(self.len())
    }

    /// Whether the node fits in a single page.
    #[must_use]
    pub fn fits_page(&self) -> bool {
        self.encoded_size() <= PAGE_SIZE
    }

    /// The encoded bytes of the node.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.encoded_size()]
    }

    /// Binary search for `key`.
    ///
    /// Returns `Ok(idx)` on an exact match, otherwise `Err(idx)` with the
    /// position where the key would be inserted.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Index of the last key `<=` `key`, or 0 when `key` sorts before every
    /// key in the node. This picks the child to descend into.
    #[must_use]
    pub fn lookup_le(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        }
    }

    /// Write record `idx`, assuming records `0..idx` are already in place
    /// and the header carries the final key count.
    pub fn append_kv(&mut self, idx: usize, ptr: PagePtr, key: &[u8], value: &[u8]) {
        self.set_child(idx, ptr);
        let pos = self.record_position(idx);
        write_u16(&mut self.data, pos, key.len() as u16);
        write_u16(&mut self.data, pos + 2, value.len() as u16);
        let start = pos + RECORD_HEADER_SIZE;
        self.data[start..start + key.len()].copy_from_slice(key);
        self.data[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);
        let next = usize::from(self.offset(idx)) + RECORD_HEADER_SIZE + key.len() + value.len();
        self.set_offset(idx + 1, next as u16);
    }

    /// Copy `n` records from `src[src_start..]` into `self[dst_start..]`,
    /// assuming records `0..dst_start` of `self` are already in place.
    pub fn append_range(&mut self, src: &Self, dst_start: usize, src_start: usize, n: usize) {
        if n == 0 {
            return;
        }
        assert!(src_start + n <= src.len(), "source range out of bounds");
        assert!(dst_start + n <= self.len(), "destination range out of bounds");

        for i in 0..n {
            self.set_child(dst_start + i, src.child(src_start + i));
        }

        let dst_begin = self.offset(dst_start);
        let src_begin = src.offset(src_start);
        for i in 1..=n {
            let offset = dst_begin + (src.offset(src_start + i) - src_begin);
            self.set_offset(dst_start + i, offset);
        }

        let begin = src.record_position(src_start);
        let end = src.record_position(src_start + n);
        let dst = self.record_position(dst_start);
        self.data[dst..dst + (end - begin)].copy_from_slice(&src.data[begin..end]);
    }

    /// Check the structural invariants of a decoded page.
    fn validate(&self) -> Result<(), NodeError> {
        let tag = read_u16(&self.data, 0);
        let node_type = NodeType::try_from(tag).map_err(NodeError::InvalidType)?;

        let n = self.len();
        if node_type == NodeType::Internal && n == 0 {
            return Err(NodeError::EmptyInternal);
        }
        let records_start = NODE_HEADER_SIZE + SLOT_SIZE * n;
        if records_start > PAGE_SIZE {
            return Err(NodeError::TooManyKeys(self.key_count()));
        }

        let mut prev = 0usize;
        for idx in 1..=n {
            let offset = usize::from(self.offset(idx));
            if offset <= prev {
                return Err(NodeError::BadOffset { index: idx });
            }
            if records_start + offset > PAGE_SIZE {
                return Err(NodeError::Oversized(records_start + offset));
            }

            if offset - prev < RECORD_HEADER_SIZE {
                return Err(NodeError::BadRecord { index: idx - 1 });
            }

            let pos = records_start + prev;
            let key_len = usize::from(read_u16(&self.data, pos));
            let value_len = usize::from(read_u16(&self.data, pos + 2));
            if RECORD_HEADER_SIZE + key_len + value_len != offset - prev {
                return Err(NodeError::BadRecord { index: idx - 1 });
            }
            if node_type == NodeType::Internal && value_len != 0 {
                return Err(NodeError::BadRecord { index: idx - 1 });
            }
            prev = offset;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("type", &self.node_type())
            .field("keys", &self.key_count())
            .field("size", &self.encoded_size())
            .finish_non_exhaustive()
    }
}

/// Errors found while decoding a page into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Unknown node type tag.
    InvalidType(u16),
    /// The key count leaves no room for the slot arrays.
    TooManyKeys(u16),
    /// Internal nodes always have at least one child.
    EmptyInternal,
    /// Offsets must be strictly increasing.
    BadOffset { index: usize },
    /// A record header disagrees with its offset span.
    BadRecord { index: usize },
    /// Records extend past the end of the page.
    Oversized(usize),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidType(tag) => write!(f, "invalid node type: {tag}"),
            Self::TooManyKeys(n) => write!(f, "key count {n} does not fit in a page"),
            Self::EmptyInternal => write!(f, "internal node has no children"),
            Self::BadOffset { index } => write!(f, "offset {index} is not increasing"),
            Self::BadRecord { index } => write!(f, "record {index} is malformed"),
            Self::Oversized(size) => {
                write!(f, "node size {size} exceeds page size {PAGE_SIZE}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn write_u16(data: &mut [u8], pos: usize, value: u16) {
    data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(data: &mut [u8], pos: usize, value: u64) {
    data[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}
